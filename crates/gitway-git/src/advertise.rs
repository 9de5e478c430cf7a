//! Reference advertisement.
//!
//! The first thing either service sends: optionally a `# service=` line and
//! flush, then one pkt-line per ref with the capability list after a NUL on
//! the first one, then a flush.

use crate::capabilities::{Capabilities, Capability, SYMREF};
use crate::pktline::PktLineWriter;
use crate::{Result, ServiceKind, SessionConfig};
use gitway_storage::{HashAlgorithm, ObjectId, ReferenceSet, Repository};
use std::collections::HashSet;
use std::io::Write;

/// An advertised ref line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefAdvertisement {
    /// Object ID the ref points to.
    pub id: ObjectId,
    /// Reference name, `HEAD`, or a peeled `<tag>^{}` entry.
    pub name: String,
}

/// Everything a session needs to remember about what it advertised.
#[derive(Debug, Clone)]
pub struct Advertisement {
    /// Service the listing was built for.
    pub service: ServiceKind,
    /// Hash function of the advertised repository.
    pub algorithm: HashAlgorithm,
    /// Lines in emission order.
    pub refs: Vec<RefAdvertisement>,
    /// Capabilities carried by the first line.
    pub capabilities: Capabilities,
    /// Refs snapshot the listing was built from.
    pub snapshot: ReferenceSet,
}

impl Advertisement {
    /// Builds the advertisement of `repo` for `service`.
    pub fn build(repo: &dyn Repository, service: ServiceKind, config: &SessionConfig) -> Result<Self> {
        let snapshot = repo.list_refs()?;
        let mut capabilities = Capabilities::for_service(service, config, repo.hash_algorithm());
        let mut refs = Vec::with_capacity(snapshot.len() + 1);

        if service == ServiceKind::UploadPack {
            match repo.head_target()? {
                Some(target) => {
                    if let Some(id) = snapshot.get(&target) {
                        refs.push(RefAdvertisement {
                            id: *id,
                            name: "HEAD".to_string(),
                        });
                        capabilities.insert(Capability::with_value(SYMREF, format!("HEAD:{}", target)));
                    }
                }
                None => {
                    if let Some(id) = repo.read_ref("HEAD")? {
                        refs.push(RefAdvertisement {
                            id,
                            name: "HEAD".to_string(),
                        });
                    }
                }
            }
        }

        for (name, id) in &snapshot {
            refs.push(RefAdvertisement {
                id: *id,
                name: name.clone(),
            });
            if service == ServiceKind::UploadPack {
                if let Some(peeled) = repo.peel_tag(id)? {
                    refs.push(RefAdvertisement {
                        id: peeled,
                        name: format!("{}^{{}}", name),
                    });
                }
            }
        }

        tracing::debug!(service = %service, refs = snapshot.len(), "built ref advertisement");
        Ok(Self {
            service,
            algorithm: repo.hash_algorithm(),
            refs,
            capabilities,
            snapshot,
        })
    }

    /// Writes the advertisement.
    pub fn write_to<W: Write>(&self, writer: &mut PktLineWriter<W>, service_prefix: bool) -> Result<()> {
        if service_prefix {
            writer.write_line(&format!("# service={}", self.service))?;
            writer.flush_pkt()?;
        }

        match self.refs.split_first() {
            Some((first, rest)) => {
                writer.write_data(
                    format!("{} {}\0{}\n", first.id, first.name, self.capabilities).as_bytes(),
                )?;
                for r in rest {
                    writer.write_line(&format!("{} {}", r.id, r.name))?;
                }
            }
            None => {
                let null = ObjectId::null(self.algorithm);
                writer.write_data(
                    format!("{} capabilities^{{}}\0{}\n", null, self.capabilities).as_bytes(),
                )?;
            }
        }

        writer.flush_pkt()?;
        writer.flush()
    }

    /// Object ids a client may name in a `want` without further checks.
    pub fn tips(&self) -> HashSet<ObjectId> {
        self.refs.iter().map(|r| r.id).collect()
    }
}

/// Builds and writes the advertisement in one step.
pub fn advertise<W: Write>(
    writer: &mut PktLineWriter<W>,
    repo: &dyn Repository,
    service: ServiceKind,
    config: &SessionConfig,
) -> Result<Advertisement> {
    let advertisement = Advertisement::build(repo, service, config)?;
    advertisement.write_to(writer, config.advertise_service_prefix)?;
    Ok(advertisement)
}
