//! Relationship touch propagation.
//!
//! Every committed create/update/destroy of a link stamps both records it
//! references with the commit time and the acting user. Stamps are
//! metadata-only writes ([`Write::Stamp`]); the store skips targets that are
//! already gone, which is the normal outcome for the destroyed side of a
//! cascading delete.

use actiontrack_core::traits::Write;
use actiontrack_core::types::{Endpoint, Link, Stamp, UserId};
use chrono::{DateTime, Utc};

/// Builds the stamp writes for one transaction.
#[derive(Debug, Clone, Copy)]
pub struct TouchPropagator {
    stamp: Stamp,
}

impl TouchPropagator {
    pub fn new(at: DateTime<Utc>, by: UserId) -> Self {
        Self {
            stamp: Stamp { at, by },
        }
    }

    pub fn stamp(&self) -> Stamp {
        self.stamp
    }

    /// Stamps for both endpoints of a committed link.
    pub fn link_committed(&self, link: &Link) -> Vec<Write> {
        self.endpoints(link.endpoints())
    }

    /// Stamps for a set of endpoints, each target once.
    pub fn endpoints(&self, targets: impl IntoIterator<Item = Endpoint>) -> Vec<Write> {
        let mut seen: Vec<Endpoint> = Vec::new();
        for target in targets {
            if !seen.contains(&target) {
                seen.push(target);
            }
        }
        seen.into_iter()
            .map(|target| Write::Stamp {
                target,
                stamp: self.stamp,
            })
            .collect()
    }

    /// Stamps for every link removed by a cascade.
    pub fn links_removed<'a>(&self, links: impl IntoIterator<Item = &'a Link>) -> Vec<Write> {
        self.endpoints(links.into_iter().flat_map(|l| l.endpoints()))
    }
}
