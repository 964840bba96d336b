use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::{fmt, fs, io};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServerEndpoint {
    pub address: String,
    pub port: u16,
    pub password: String,
    #[serde(default)]
    pub comment: String,
}

impl ServerEndpoint {
    pub fn key(&self) -> String {
        endpoint_key(&self.address, self.port)
    }
}

pub fn endpoint_key(address: &str, port: u16) -> String {
    format!("{address}:{port}")
}

/// Endpoint as shown to operators; the password never leaves the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointView {
    pub address: String,
    pub port: u16,
    pub comment: String,
}

impl From<&ServerEndpoint> for EndpointView {
    fn from(endpoint: &ServerEndpoint) -> Self {
        Self {
            address: endpoint.address.clone(),
            port: endpoint.port,
            comment: endpoint.comment.clone(),
        }
    }
}

#[derive(Debug)]
pub enum RegistryError {
    Io(io::Error),
    Json(serde_json::Error),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "registry io error: {err}"),
            Self::Json(err) => write!(f, "registry json error: {err}"),
        }
    }
}

impl std::error::Error for RegistryError {}

#[derive(Debug, Default, Deserialize, Serialize)]
struct RegistryFile {
    #[serde(default)]
    rcon: Vec<ServerEndpoint>,
}

#[derive(Debug, Clone)]
pub struct EndpointRegistry {
    path: PathBuf,
    endpoints: BTreeMap<String, ServerEndpoint>,
}

impl EndpointRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            endpoints: BTreeMap::new(),
        }
    }

    /// Loads the persisted endpoint list. A broken file yields an empty
    /// registry together with the error so startup can warn and carry on.
    pub fn load(path: impl Into<PathBuf>) -> (Self, Option<RegistryError>) {
        let mut registry = Self::new(path);
        if !registry.path.exists() {
            return (registry, None);
        }
        match read_registry_file(&registry.path) {
            Ok(file) => {
                for endpoint in file.rcon {
                    registry.endpoints.insert(endpoint.key(), endpoint);
                }
                (registry, None)
            }
            Err(err) => (registry, Some(err)),
        }
    }

    pub fn save(&self) -> Result<(), RegistryError> {
        let file = RegistryFile {
            rcon: self.endpoints.values().cloned().collect(),
        };
        let data = serde_json::to_string_pretty(&file).map_err(RegistryError::Json)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(RegistryError::Io)?;
            }
        }
        fs::write(&self.path, data).map_err(RegistryError::Io)
    }

    /// Writes the registry on the blocking pool and hands it back once it is
    /// on disk.
    pub async fn persist(self) -> Result<Self, RegistryError> {
        tokio::task::spawn_blocking(move || self.save().map(|()| self))
            .await
            .map_err(|err| RegistryError::Io(io::Error::new(io::ErrorKind::Other, err)))?
    }

    pub fn register(&mut self, endpoint: ServerEndpoint) -> Option<ServerEndpoint> {
        self.endpoints.insert(endpoint.key(), endpoint)
    }

    pub fn unregister(&mut self, address: &str, port: u16) -> Option<ServerEndpoint> {
        self.endpoints.remove(&endpoint_key(address, port))
    }

    pub fn list(&self) -> Vec<EndpointView> {
        self.endpoints.values().map(EndpointView::from).collect()
    }

    /// Copy of every endpoint for one poll tick.
    pub fn snapshot(&self) -> Vec<ServerEndpoint> {
        self.endpoints.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_registry_file(path: &Path) -> Result<RegistryFile, RegistryError> {
    let raw = fs::read_to_string(path).map_err(RegistryError::Io)?;
    serde_json::from_str(&raw).map_err(RegistryError::Json)
}
