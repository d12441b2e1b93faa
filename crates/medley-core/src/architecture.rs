//! Distribution topologies and the ordered cycle selecting the active one.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::MedleyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// Direct peer-to-peer sessions with every member.
    Mesh,
    /// One session with a selective-forwarding server.
    Sfu,
    /// One session with a mixing server delivering a single composed stream.
    Mcu,
}

impl Topology {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topology::Mesh => "mesh",
            Topology::Sfu => "sfu",
            Topology::Mcu => "mcu",
        }
    }

    /// Topologies that deliver one track per remote participant.
    pub fn aggregates_tracks(&self) -> bool {
        matches!(self, Topology::Mesh | Topology::Sfu)
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topology {
    type Err = MedleyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mesh" => Ok(Topology::Mesh),
            "sfu" => Ok(Topology::Sfu),
            "mcu" => Ok(Topology::Mcu),
            other => Err(MedleyError::UnknownArchitecture(other.to_string())),
        }
    }
}

pub fn default_architectures() -> Vec<Topology> {
    vec![Topology::Mesh, Topology::Sfu, Topology::Mcu]
}

/// Circular pointer over a fixed list of topologies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchitectureSelector {
    architectures: Vec<Topology>,
    current: usize,
}

impl ArchitectureSelector {
    pub fn new(architectures: Vec<Topology>, initial: Topology) -> Result<Self, MedleyError> {
        let current = architectures
            .iter()
            .position(|a| *a == initial)
            .ok_or_else(|| MedleyError::UnknownArchitecture(initial.to_string()))?;
        Ok(Self {
            architectures,
            current,
        })
    }

    pub fn current(&self) -> Topology {
        self.architectures[self.current]
    }

    pub fn next(&self) -> Topology {
        self.architectures[(self.current + 1) % self.architectures.len()]
    }

    pub fn previous(&self) -> Topology {
        let len = self.architectures.len();
        self.architectures[(self.current + len - 1) % len]
    }

    pub fn architectures(&self) -> &[Topology] {
        &self.architectures
    }

    /// Moves the pointer. Only the switch algorithm calls this.
    pub(crate) fn switch_to(&mut self, architecture: Topology) -> Result<Topology, MedleyError> {
        let index = self
            .architectures
            .iter()
            .position(|a| *a == architecture)
            .ok_or_else(|| MedleyError::UnknownArchitecture(architecture.to_string()))?;
        let previous = self.current();
        self.current = index;
        Ok(previous)
    }
}

impl Default for ArchitectureSelector {
    fn default() -> Self {
        Self {
            architectures: default_architectures(),
            current: 0,
        }
    }
}
