use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::atomic_io::write_atomic;
use crate::hashing::{digests_match, sha256_file};
use crate::types::{WorldEnvironment, WorldType};

pub const DEFAULT_MEMORY_MB: u32 = 1024;

/// Everything the harness needs to launch and reach a prepared server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeManifest {
    pub server_type: String,
    pub server_version: String,
    pub server_directory: PathBuf,
    pub server_jar: PathBuf,
    pub uds_socket_path: PathBuf,
    pub agent_auth_token: String,
    pub runtime_protocol_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_jar: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_jar_sha256: Option<String>,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    #[serde(default)]
    pub preloaded_worlds: Vec<PreloadedWorld>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreloadedWorld {
    pub name: String,
    #[serde(default)]
    pub environment: WorldEnvironment,
    #[serde(default)]
    pub world_type: WorldType,
    #[serde(default)]
    pub seed: i64,
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read runtime manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write runtime manifest {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse runtime manifest {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("runtime manifest field {field} must not be blank")]
    BlankField { field: &'static str },
    #[error("server directory does not exist or is not a directory: {path}")]
    ServerDirectoryMissing { path: PathBuf },
    #[error("server jar does not exist or is not a file: {path}")]
    ServerJarMissing { path: PathBuf },
    #[error("failed to hash agent jar {path}: {source}")]
    AgentJarUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("agent jar {path} has sha256 {actual}, manifest expects {expected}")]
    AgentJarDigestMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

fn default_memory_mb() -> u32 {
    DEFAULT_MEMORY_MB
}

impl RuntimeManifest {
    /// Reads a manifest; relative paths are resolved against the manifest's directory.
    pub fn read(path: &Path) -> Result<Self, ManifestError> {
        let raw = fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut manifest = parse_manifest_json(&raw).map_err(|message| ManifestError::Parse {
            path: path.to_path_buf(),
            message,
        })?;
        if let Some(base) = path.parent() {
            manifest.resolve_relative_to(base);
        }
        Ok(manifest)
    }

    pub fn write(&self, path: &Path) -> Result<(), ManifestError> {
        let mut text = serde_json::to_string_pretty(self).map_err(|error| ManifestError::Parse {
            path: path.to_path_buf(),
            message: error.to_string(),
        })?;
        text.push('\n');
        write_atomic(path, &text).map_err(|source| ManifestError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Checks the fields and paths the harness depends on before launching anything.
    pub fn validate(&self) -> Result<(), ManifestError> {
        require_non_blank("serverType", &self.server_type)?;
        require_non_blank("serverVersion", &self.server_version)?;
        require_non_blank("agentAuthToken", &self.agent_auth_token)?;
        require_non_blank("runtimeProtocolVersion", &self.runtime_protocol_version)?;
        if self.uds_socket_path.as_os_str().is_empty() {
            return Err(ManifestError::BlankField {
                field: "udsSocketPath",
            });
        }
        if !self.server_directory.is_dir() {
            return Err(ManifestError::ServerDirectoryMissing {
                path: self.server_directory.clone(),
            });
        }
        if !self.server_jar.is_file() {
            return Err(ManifestError::ServerJarMissing {
                path: self.server_jar.clone(),
            });
        }
        self.verify_agent_jar_digest()
    }

    /// Expected agent digest, or an empty string when the manifest does not pin one.
    pub fn expected_agent_digest(&self) -> &str {
        self.agent_jar_sha256.as_deref().map(str::trim).unwrap_or("")
    }

    fn verify_agent_jar_digest(&self) -> Result<(), ManifestError> {
        let (Some(jar), Some(expected)) = (&self.agent_jar, &self.agent_jar_sha256) else {
            return Ok(());
        };
        if expected.trim().is_empty() {
            return Ok(());
        }
        let actual = sha256_file(jar).map_err(|source| ManifestError::AgentJarUnreadable {
            path: jar.clone(),
            source,
        })?;
        if !digests_match(expected, &actual) {
            return Err(ManifestError::AgentJarDigestMismatch {
                path: jar.clone(),
                expected: expected.trim().to_string(),
                actual,
            });
        }
        Ok(())
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        resolve_in_place(&mut self.server_directory, base);
        resolve_in_place(&mut self.server_jar, base);
        resolve_in_place(&mut self.uds_socket_path, base);
        if let Some(agent_jar) = self.agent_jar.as_mut() {
            resolve_in_place(agent_jar, base);
        }
    }
}

fn parse_manifest_json(raw: &str) -> Result<RuntimeManifest, String> {
    let mut deserializer = serde_json::Deserializer::from_str(raw);
    match serde_path_to_error::deserialize::<_, RuntimeManifest>(&mut deserializer) {
        Ok(manifest) => Ok(manifest),
        Err(error) => {
            let path = error.path().to_string();
            let source = error.into_inner();
            if path.is_empty() || path == "." {
                Err(source.to_string())
            } else {
                Err(format!("at {path}: {source}"))
            }
        }
    }
}

fn require_non_blank(field: &'static str, value: &str) -> Result<(), ManifestError> {
    if value.trim().is_empty() {
        return Err(ManifestError::BlankField { field });
    }
    Ok(())
}

fn resolve_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() && !path.as_os_str().is_empty() {
        *path = base.join(&*path);
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::hashing::sha256_hex;

    fn manifest_json(server_dir: &str, jar: &str) -> String {
        format!(
            r#"{{
                "serverType": "paper",
                "serverVersion": "1.21.4",
                "serverDirectory": "{server_dir}",
                "serverJar": "{jar}",
                "udsSocketPath": "run/agent.sock",
                "agentAuthToken": "secret",
                "runtimeProtocolVersion": "v1",
                "cacheKey": "ignored-by-reader",
                "preloadedWorlds": [{{"name": "arena", "worldType": "FLAT"}}]
            }}"#
        )
    }

    fn write_server_layout(temp: &TempDir) -> PathBuf {
        let server_dir = temp.path().join("server");
        fs::create_dir_all(&server_dir).expect("mkdir server");
        fs::write(server_dir.join("server.jar"), b"jar").expect("write jar");
        let manifest_path = temp.path().join("manifest.json");
        fs::write(&manifest_path, manifest_json("server", "server/server.jar")).expect("write");
        manifest_path
    }

    #[test]
    fn reads_manifest_with_defaults_and_resolves_relative_paths() {
        let temp = TempDir::new().expect("tempdir");
        let manifest_path = write_server_layout(&temp);

        let manifest = RuntimeManifest::read(&manifest_path).expect("read manifest");
        assert_eq!(manifest.memory_mb, DEFAULT_MEMORY_MB);
        assert_eq!(manifest.server_directory, temp.path().join("server"));
        assert_eq!(manifest.uds_socket_path, temp.path().join("run/agent.sock"));
        assert_eq!(manifest.preloaded_worlds.len(), 1);
        assert_eq!(manifest.preloaded_worlds[0].world_type, WorldType::Flat);
        assert_eq!(
            manifest.preloaded_worlds[0].environment,
            WorldEnvironment::Normal
        );
        assert_eq!(manifest.expected_agent_digest(), "");
        manifest.validate().expect("valid layout");
    }

    #[test]
    fn missing_required_field_is_named_in_the_error() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("manifest.json");
        fs::write(
            &path,
            r#"{"serverType":"paper","serverVersion":"1.21","serverDirectory":"s","serverJar":"j","agentAuthToken":"t","runtimeProtocolVersion":"v1"}"#,
        )
        .expect("write");

        let error = RuntimeManifest::read(&path).expect_err("missing socket path");
        assert!(error.to_string().contains("udsSocketPath"), "{error}");
    }

    #[test]
    fn wrongly_typed_nested_field_reports_its_path() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("manifest.json");
        let raw = manifest_json("server", "server.jar")
            .replace(r#""worldType": "FLAT""#, r#""seed": "not-a-number""#);
        fs::write(&path, raw).expect("write");

        let error = RuntimeManifest::read(&path).expect_err("bad seed");
        assert!(error.to_string().contains("preloadedWorlds[0].seed"), "{error}");
    }

    #[test]
    fn validate_rejects_missing_server_directory_and_jar() {
        let temp = TempDir::new().expect("tempdir");
        let manifest_path = write_server_layout(&temp);
        let mut manifest = RuntimeManifest::read(&manifest_path).expect("read");

        manifest.server_jar = temp.path().join("server");
        assert!(matches!(
            manifest.validate(),
            Err(ManifestError::ServerJarMissing { .. })
        ));

        manifest.server_directory = temp.path().join("nowhere");
        assert!(matches!(
            manifest.validate(),
            Err(ManifestError::ServerDirectoryMissing { .. })
        ));
    }

    #[test]
    fn validate_checks_agent_jar_digest_when_pinned() {
        let temp = TempDir::new().expect("tempdir");
        let manifest_path = write_server_layout(&temp);
        let agent_jar = temp.path().join("agent.jar");
        fs::write(&agent_jar, b"agent-bytes").expect("write agent");
        let mut manifest = RuntimeManifest::read(&manifest_path).expect("read");
        manifest.agent_jar = Some(agent_jar);

        manifest.agent_jar_sha256 = Some(sha256_hex(b"agent-bytes").to_ascii_uppercase());
        manifest.validate().expect("digest matches");

        manifest.agent_jar_sha256 = Some(sha256_hex(b"other"));
        assert!(matches!(
            manifest.validate(),
            Err(ManifestError::AgentJarDigestMismatch { .. })
        ));
    }

    #[test]
    fn written_manifest_reads_back() {
        let temp = TempDir::new().expect("tempdir");
        let manifest_path = write_server_layout(&temp);
        let manifest = RuntimeManifest::read(&manifest_path).expect("read");
        let copy_path = temp.path().join("copy.json");

        manifest.write(&copy_path).expect("write copy");
        assert_eq!(RuntimeManifest::read(&copy_path).expect("reread"), manifest);
    }
}
