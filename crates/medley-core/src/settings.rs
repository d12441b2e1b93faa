use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::architecture::{Topology, default_architectures};

/// How simultaneous renegotiation attempts are resolved.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationPolicy {
    /// Yielding side rolls back its own offer ("perfect negotiation").
    #[default]
    Rollback,
    /// Each round is reserved through lock:init / lock:accept / lock:release.
    SignaledLock,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ConferenceConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_architecture")]
    pub architecture: Topology,
    #[serde(default = "default_architectures")]
    pub architectures: Vec<Topology>,
    #[serde(default)]
    pub policy: NegotiationPolicy,
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default = "default_sfu_peer")]
    pub sfu_peer: String,
    #[serde(default = "default_mcu_peer")]
    pub mcu_peer: String,
    #[serde(default = "default_switch_server")]
    pub switch_server: String,
}

fn default_architecture() -> Topology {
    Topology::Mesh
}

fn default_sfu_peer() -> String {
    "@sfu".to_string()
}

fn default_mcu_peer() -> String {
    "@mcu".to_string()
}

fn default_switch_server() -> String {
    "@server".to_string()
}

impl Default for ConferenceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            architecture: default_architecture(),
            architectures: default_architectures(),
            policy: NegotiationPolicy::default(),
            ice_servers: Vec::new(),
            verbose: false,
            sfu_peer: default_sfu_peer(),
            mcu_peer: default_mcu_peer(),
            switch_server: default_switch_server(),
        }
    }
}

impl ConferenceConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Session options towards `peer`, inheriting the conference-wide settings.
    pub fn session(&self, peer: &str) -> SessionConfig {
        SessionConfig {
            id: None,
            name: self.name.clone(),
            peer: peer.to_string(),
            yielding: None,
            policy: self.policy,
            ice_servers: self.ice_servers.clone(),
            verbose: self.verbose,
        }
    }
}

/// Options of one peer session.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    /// Generated when absent.
    pub id: Option<String>,
    pub name: String,
    pub peer: String,
    /// Overrides the id tie-break. Both ends must then be set to opposite values.
    pub yielding: Option<bool>,
    pub policy: NegotiationPolicy,
    pub ice_servers: Vec<IceServer>,
    pub verbose: bool,
}

impl SessionConfig {
    pub fn new(name: impl Into<String>, peer: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            peer: peer.into(),
            yielding: None,
            policy: NegotiationPolicy::default(),
            ice_servers: Vec::new(),
            verbose: false,
        }
    }

    pub fn with_policy(mut self, policy: NegotiationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_yielding(mut self, yielding: bool) -> Self {
        self.yielding = Some(yielding);
        self
    }

    /// The lexicographically greater id keeps its offer; the smaller one yields.
    pub fn is_yielding(&self) -> bool {
        self.yielding.unwrap_or(self.name < self.peer)
    }
}

pub struct ConfigStore {
    config: Mutex<ConferenceConfig>,
    file_path: PathBuf,
}

impl ConfigStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let file_path = data_dir.as_ref().join("conference.json");
        let config = Self::load(&file_path);
        Self {
            config: Mutex::new(config),
            file_path,
        }
    }

    pub fn get(&self) -> ConferenceConfig {
        self.lock().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.lock().name = name.into();
        self.save();
    }

    pub fn set_architecture(&self, architecture: Topology) {
        self.lock().architecture = architecture;
        self.save();
    }

    pub fn set_policy(&self, policy: NegotiationPolicy) {
        self.lock().policy = policy;
        self.save();
    }

    pub fn set_verbose(&self, verbose: bool) {
        self.lock().verbose = verbose;
        self.save();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConferenceConfig> {
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn save(&self) {
        let config = self.get();
        if let Some(parent) = self.file_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&config) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.file_path, json) {
                    tracing::warn!("failed to persist {}: {e}", self.file_path.display());
                }
            }
            Err(e) => tracing::warn!("failed to encode conference config: {e}"),
        }
    }

    fn load(path: &Path) -> ConferenceConfig {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("ignoring corrupt {}: {e}", path.display());
                ConferenceConfig::default()
            }),
            Err(_) => ConferenceConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn test_default_config() {
        let c = ConferenceConfig::default();
        assert_eq!(c.architecture, Topology::Mesh);
        assert_eq!(c.architectures, vec![Topology::Mesh, Topology::Sfu, Topology::Mcu]);
        assert_eq!(c.policy, NegotiationPolicy::Rollback);
        assert_eq!(c.sfu_peer, "@sfu");
        assert_eq!(c.mcu_peer, "@mcu");
        assert_eq!(c.switch_server, "@server");
    }

    #[test]
    fn test_new_creates_defaults_when_no_file() {
        let dir = temp_dir();
        let store = ConfigStore::new(dir.path());
        assert_eq!(store.get(), ConferenceConfig::default());
    }

    #[test]
    fn test_setters_persist() {
        let dir = temp_dir();
        {
            let store = ConfigStore::new(dir.path());
            store.set_name("alice");
            store.set_architecture(Topology::Sfu);
            store.set_policy(NegotiationPolicy::SignaledLock);
            store.set_verbose(true);
        }
        let c = ConfigStore::new(dir.path()).get();
        assert_eq!(c.name, "alice");
        assert_eq!(c.architecture, Topology::Sfu);
        assert_eq!(c.policy, NegotiationPolicy::SignaledLock);
        assert!(c.verbose);
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let dir = temp_dir();
        fs::write(dir.path().join("conference.json"), "not json!!!").unwrap();
        let store = ConfigStore::new(dir.path());
        assert_eq!(store.get(), ConferenceConfig::default());
    }

    #[test]
    fn test_partial_json_uses_serde_defaults() {
        let dir = temp_dir();
        fs::write(
            dir.path().join("conference.json"),
            r#"{"name":"eve","policy":"signaled-lock"}"#,
        )
        .unwrap();
        let c = ConfigStore::new(dir.path()).get();
        assert_eq!(c.name, "eve");
        assert_eq!(c.policy, NegotiationPolicy::SignaledLock);
        assert_eq!(c.architecture, Topology::Mesh);
        assert_eq!(c.mcu_peer, "@mcu");
    }

    #[test]
    fn test_tie_break_and_override() {
        assert!(SessionConfig::new("alice", "bob").is_yielding());
        assert!(!SessionConfig::new("bob", "alice").is_yielding());
        assert!(!SessionConfig::new("alice", "@sfu").is_yielding());
        assert!(!SessionConfig::new("alice", "bob").with_yielding(false).is_yielding());
    }
}
