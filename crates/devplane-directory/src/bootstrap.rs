//! One-shot directory bootstrap
//!
//! Adds schemas, then organizational units, then users, then groups. Items
//! are tried once each; a failure is logged and recorded and the routine
//! moves on, so one bad entry never blocks the rest of the seed.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ldap::{DirectoryClient, EntryOutcome};
use crate::seed::{DirectoryEntry, DirectorySeed};

/// DNs grouped by what happened to them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapReport {
    /// Added by this run
    pub created: Vec<String>,
    /// Already present
    pub existing: Vec<String>,
    /// Rejected by the server
    pub failed: Vec<FailedEntry>,
}

/// An entry the server rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEntry {
    /// DN of the entry
    pub dn: String,
    /// Server or transport error
    pub error: String,
}

impl BootstrapReport {
    /// True when every item was created or already present
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, dn: &str, result: Result<EntryOutcome, crate::DirectoryError>) {
        match result {
            Ok(EntryOutcome::Created) => {
                info!(dn, "directory entry created");
                self.created.push(dn.to_string());
            }
            Ok(EntryOutcome::AlreadyExists) => {
                info!(dn, "directory entry already present");
                self.existing.push(dn.to_string());
            }
            Err(e) => {
                warn!(dn, error = %e, "directory entry failed, continuing");
                self.failed.push(FailedEntry {
                    dn: dn.to_string(),
                    error: e.to_string(),
                });
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Target {
    Schema,
    Data,
}

/// Apply the seed to the directory
pub async fn run_bootstrap(directory: &dyn DirectoryClient, seed: &DirectorySeed) -> BootstrapReport {
    let phases: [(&str, Target, Vec<DirectoryEntry>); 4] = [
        ("schemas", Target::Schema, seed.schema_entries()),
        ("organizational units", Target::Data, seed.ou_entries()),
        ("users", Target::Data, seed.user_entries()),
        ("groups", Target::Data, seed.group_entries()),
    ];

    let mut report = BootstrapReport::default();
    for (phase, target, entries) in phases {
        info!(phase, count = entries.len(), "bootstrapping directory");
        for entry in &entries {
            let result = match target {
                Target::Schema => directory.add_schema(entry).await,
                Target::Data => directory.add_entry(entry).await,
            };
            report.record(&entry.dn, result);
        }
    }

    info!(
        created = report.created.len(),
        existing = report.existing.len(),
        failed = report.failed.len(),
        "directory bootstrap finished"
    );
    report
}
