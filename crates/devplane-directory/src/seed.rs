//! Directory seed: schemas, organizational units, users and groups
//!
//! Loaded from YAML or built in. The seed is data only; [`DirectorySeed`]
//! turns it into ordered [`DirectoryEntry`] values the bootstrap adds one by
//! one.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::DirectoryError;

/// Base DN used when no seed file is given
pub const DEFAULT_BASE_DN: &str = "dc=devplane,dc=local";

/// Parent of every schema entry in the server's config tree
pub const SCHEMA_CONFIG_DN: &str = "cn=schema,cn=config";

/// A schema added under [`SCHEMA_CONFIG_DN`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDefinition {
    /// `cn` of the schema entry
    pub name: String,
    /// `olcAttributeTypes` definitions
    #[serde(default)]
    pub attribute_types: Vec<String>,
    /// `olcObjectClasses` definitions
    #[serde(default)]
    pub object_classes: Vec<String>,
}

/// Organizational unit directly below the base DN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationalUnit {
    /// `ou` value
    pub name: String,
    /// Optional `description`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A person entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedUser {
    /// Login name; the RDN
    pub uid: String,
    /// `givenName`
    pub given_name: String,
    /// `sn`
    pub surname: String,
    /// `mail`
    pub email: String,
    /// Initial password; omitted users cannot bind until one is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Parent unit, `people` by default
    #[serde(default = "default_people_ou")]
    pub ou: String,
}

/// A `groupOfNames` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedGroup {
    /// `cn` of the group
    pub name: String,
    /// Member uids from [`DirectorySeed::users`], or full DNs
    #[serde(default)]
    pub members: Vec<String>,
    /// Parent unit, `groups` by default
    #[serde(default = "default_groups_ou")]
    pub ou: String,
}

fn default_people_ou() -> String {
    "people".to_string()
}

fn default_groups_ou() -> String {
    "groups".to_string()
}

/// Everything the bootstrap writes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectorySeed {
    /// Suffix every data entry lives under
    pub base_dn: String,
    /// Applied first, through the config bind
    #[serde(default)]
    pub schemas: Vec<SchemaDefinition>,
    /// Applied before users and groups
    #[serde(default)]
    pub organizational_units: Vec<OrganizationalUnit>,
    /// People
    #[serde(default)]
    pub users: Vec<SeedUser>,
    /// Applied last so members already exist
    #[serde(default)]
    pub groups: Vec<SeedGroup>,
}

/// One entry to add: DN plus attributes (multi-valued, ordered for stable output)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Distinguished name
    pub dn: String,
    /// Attribute name to values
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl DirectoryEntry {
    fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: BTreeMap::new(),
        }
    }

    fn with(mut self, name: &str, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        if !values.is_empty() {
            self.attributes.insert(name.to_string(), values);
        }
        self
    }
}

impl Default for DirectorySeed {
    fn default() -> Self {
        Self {
            base_dn: DEFAULT_BASE_DN.to_string(),
            schemas: vec![SchemaDefinition {
                name: "devplane".to_string(),
                attribute_types: vec![
                    "( 1.3.6.1.4.1.59999.1.1 NAME 'devplaneRole' DESC 'Platform role' \
                     EQUALITY caseIgnoreMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 )"
                        .to_string(),
                ],
                object_classes: vec![
                    "( 1.3.6.1.4.1.59999.2.1 NAME 'devplaneUser' DESC 'Platform user' \
                     SUP top AUXILIARY MAY ( devplaneRole ) )"
                        .to_string(),
                ],
            }],
            organizational_units: vec![
                OrganizationalUnit {
                    name: "people".to_string(),
                    description: Some("Platform users".to_string()),
                },
                OrganizationalUnit {
                    name: "groups".to_string(),
                    description: Some("Platform groups".to_string()),
                },
            ],
            users: vec![SeedUser {
                uid: "admin".to_string(),
                given_name: "Platform".to_string(),
                surname: "Admin".to_string(),
                email: "admin@devplane.local".to_string(),
                password: None,
                ou: default_people_ou(),
            }],
            groups: vec![
                SeedGroup {
                    name: "admins".to_string(),
                    members: vec!["admin".to_string()],
                    ou: default_groups_ou(),
                },
                SeedGroup {
                    name: "developers".to_string(),
                    members: vec!["admin".to_string()],
                    ou: default_groups_ou(),
                },
            ],
        }
    }
}

impl DirectorySeed {
    /// Load a seed from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, DirectoryError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| DirectoryError::seed(path.display().to_string(), e.to_string()))?;
        Self::from_yaml(&raw, &path.display().to_string())
    }

    /// Parse a seed from YAML text; `source_name` labels errors
    pub fn from_yaml(raw: &str, source_name: &str) -> Result<Self, DirectoryError> {
        let seed: Self = serde_yaml::from_str(raw)
            .map_err(|e| DirectoryError::seed(source_name, e.to_string()))?;
        seed.validate(source_name)?;
        Ok(seed)
    }

    /// Load from `path` when given, else use the built-in seed
    pub fn load(path: Option<&Path>) -> Result<Self, DirectoryError> {
        match path {
            Some(p) => Self::from_file(p),
            None => Ok(Self::default()),
        }
    }

    /// Render as YAML
    pub fn to_yaml(&self) -> Result<String, DirectoryError> {
        serde_yaml::to_string(self).map_err(|e| DirectoryError::seed("seed", e.to_string()))
    }

    fn validate(&self, source_name: &str) -> Result<(), DirectoryError> {
        if self.base_dn.trim().is_empty() {
            return Err(DirectoryError::seed(source_name, "baseDn must not be empty"));
        }
        if let Some(g) = self.groups.iter().find(|g| g.members.is_empty()) {
            // groupOfNames requires at least one member
            return Err(DirectoryError::seed(
                source_name,
                format!("group {} has no members", g.name),
            ));
        }
        Ok(())
    }

    fn ou_dn(&self, ou: &str) -> String {
        format!("ou={},{}", ou, self.base_dn)
    }

    fn user_dn(&self, user: &SeedUser) -> String {
        format!("uid={},{}", user.uid, self.ou_dn(&user.ou))
    }

    /// Resolve a group member to a DN; DNs pass through, uids are looked up
    /// among the seed users and otherwise placed under `ou=people`
    fn member_dn(&self, member: &str) -> String {
        if member.contains('=') {
            return member.to_string();
        }
        match self.users.iter().find(|u| u.uid == member) {
            Some(user) => self.user_dn(user),
            None => format!("uid={},{}", member, self.ou_dn(&default_people_ou())),
        }
    }

    /// Schema entries for the config tree
    pub fn schema_entries(&self) -> Vec<DirectoryEntry> {
        self.schemas
            .iter()
            .map(|s| {
                DirectoryEntry::new(format!("cn={},{}", s.name, SCHEMA_CONFIG_DN))
                    .with("objectClass", ["olcSchemaConfig"])
                    .with("cn", [s.name.as_str()])
                    .with("olcAttributeTypes", s.attribute_types.iter().map(String::as_str))
                    .with("olcObjectClasses", s.object_classes.iter().map(String::as_str))
            })
            .collect()
    }

    /// Organizational unit entries
    pub fn ou_entries(&self) -> Vec<DirectoryEntry> {
        self.organizational_units
            .iter()
            .map(|ou| {
                DirectoryEntry::new(self.ou_dn(&ou.name))
                    .with("objectClass", ["top", "organizationalUnit"])
                    .with("ou", [ou.name.as_str()])
                    .with("description", ou.description.as_deref())
            })
            .collect()
    }

    /// Person entries
    pub fn user_entries(&self) -> Vec<DirectoryEntry> {
        self.users
            .iter()
            .map(|u| {
                DirectoryEntry::new(self.user_dn(u))
                    .with(
                        "objectClass",
                        ["top", "person", "organizationalPerson", "inetOrgPerson"],
                    )
                    .with("uid", [u.uid.as_str()])
                    .with("cn", [format!("{} {}", u.given_name, u.surname)])
                    .with("givenName", [u.given_name.as_str()])
                    .with("sn", [u.surname.as_str()])
                    .with("mail", [u.email.as_str()])
                    .with("userPassword", u.password.as_deref())
            })
            .collect()
    }

    /// Group entries with resolved member DNs
    pub fn group_entries(&self) -> Vec<DirectoryEntry> {
        self.groups
            .iter()
            .map(|g| {
                DirectoryEntry::new(format!("cn={},{}", g.name, self.ou_dn(&g.ou)))
                    .with("objectClass", ["top", "groupOfNames"])
                    .with("cn", [g.name.as_str()])
                    .with("member", g.members.iter().map(|m| self.member_dn(m)))
            })
            .collect()
    }
}
