//! Secret Decrypter (spec §4.4): copies a project's worktree to a
//! sibling directory and rewrites any file listed in `secrets/secrets.cue`
//! with its decrypted plaintext, leaving the original tree untouched.
//!
//! `secrets/recipients.cue` and `secrets/secrets.cue` are written by the
//! configuration compiler (an external collaborator, DESIGN NOTES
//! "Configuration language"); here we only need the constrained,
//! CUE-compatible subset those two index files actually use — a
//! top-level list of quoted strings and a top-level map of quoted
//! string keys to quoted (possibly triple-quoted) string values. A full
//! CUE evaluator is out of scope for the core.

use crate::errors::{CommandError, CoreError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[derive(Debug, Default, Clone)]
pub struct SecretsIndex {
    /// relative file path -> armored age ciphertext
    pub entries: BTreeMap<PathBuf, String>,
}

/// Fetches a value out of a well-known Kubernetes `Secret` — the
/// cluster-facing half of the decrypter. A thin interface because the
/// Kubernetes client itself is the external collaborator; the decrypter
/// only needs bytes back.
#[async_trait]
pub trait ClusterSecretProvider: Send + Sync {
    async fn get_secret_key(&self, namespace: &str, name: &str, key: &str) -> Result<Vec<u8>, CoreError>;
}

pub struct KubeSecretProvider {
    pub client: kube::Client,
}

#[async_trait]
impl ClusterSecretProvider for KubeSecretProvider {
    async fn get_secret_key(&self, namespace: &str, name: &str, key: &str) -> Result<Vec<u8>, CoreError> {
        use k8s_openapi::api::core::v1::Secret;
        use kube::api::Api;

        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get(name).await.map_err(|err| match err {
            kube::Error::Api(resp) if resp.code == 404 => CoreError::permanent(
                "KeyNotFound",
                CommandError::new_from_safe_message(format!("secret {namespace}/{name} not found")),
            ),
            other => CoreError::from(other),
        })?;

        secret
            .data
            .as_ref()
            .and_then(|data| data.get(key))
            .map(|bytes| bytes.0.clone())
            .ok_or_else(|| {
                CoreError::permanent(
                    "KeyNotFound",
                    CommandError::new_from_safe_message(format!("secret {namespace}/{name} has no key `{key}`")),
                )
            })
    }
}

#[derive(Debug, Clone)]
pub struct SecretDecrypterConfig {
    pub controller_namespace: String,
    pub worker_pool_size: usize,
}

pub struct SecretDecrypter {
    provider: Arc<dyn ClusterSecretProvider>,
    config: SecretDecrypterConfig,
}

impl SecretDecrypter {
    pub fn new(provider: Arc<dyn ClusterSecretProvider>, config: SecretDecrypterConfig) -> Self {
        SecretDecrypter { provider, config }
    }

    /// Copies `project_root` into `decrypted_root` and rewrites every
    /// path listed by `secrets/secrets.cue` in place. Returns
    /// `decrypted_root` on success; `project_root` is never modified.
    pub async fn decrypt(&self, project_root: &Path, decrypted_root: &Path) -> Result<PathBuf, CoreError> {
        copy_dir_recursive(project_root, decrypted_root).await?;

        let secrets_cue = decrypted_root.join("secrets").join("secrets.cue");
        if !tokio::fs::try_exists(&secrets_cue).await.unwrap_or(false) {
            return Ok(decrypted_root.to_path_buf());
        }

        let text = tokio::fs::read_to_string(&secrets_cue).await?;
        let index = parse_secrets_index(&text)?;
        if index.entries.is_empty() {
            return Ok(decrypted_root.to_path_buf());
        }

        let key_bytes = self.provider.get_secret_key(&self.config.controller_namespace, "dec-key", "priv").await?;
        let identity = parse_age_identity(&key_bytes)?;

        let semaphore = Arc::new(Semaphore::new(self.config.worker_pool_size.max(1)));
        let mut tasks = JoinSet::new();
        for (relative_path, armored) in index.entries {
            let semaphore = semaphore.clone();
            let identity = identity.clone();
            let destination = decrypted_root.join(&relative_path);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                let plaintext = tokio::task::spawn_blocking(move || decrypt_one(&identity, &armored))
                    .await
                    .expect("decrypt task panicked")?;
                tokio::fs::write(&destination, plaintext).await?;
                Ok::<(), CoreError>(())
            });
        }

        while let Some(joined) = tasks.join_next().await {
            joined.map_err(|err| CoreError::permanent("DecryptTaskPanicked", CommandError::new_from_safe_message(err.to_string())))??;
        }

        Ok(decrypted_root.to_path_buf())
    }
}

#[derive(Clone)]
struct Identity(age::x25519::Identity);

fn parse_age_identity(key_bytes: &[u8]) -> Result<Identity, CoreError> {
    let text = std::str::from_utf8(key_bytes)
        .map_err(|err| CoreError::permanent("InvalidKey", CommandError::new_from_safe_message(err.to_string())))?
        .trim();
    let identity = age::x25519::Identity::from_str(text)
        .map_err(|err| CoreError::permanent("InvalidKey", CommandError::new_from_safe_message(err.to_string())))?;
    Ok(Identity(identity))
}

fn decrypt_one(identity: &Identity, armored: &str) -> Result<Vec<u8>, CoreError> {
    use std::io::Read;

    let armored_reader = age::armor::ArmoredReader::new(armored.as_bytes());
    let decryptor = age::Decryptor::new(armored_reader)
        .map_err(|err| CoreError::permanent("DecryptFailed", CommandError::new_from_safe_message(err.to_string())))?;

    let age::Decryptor::Recipients(decryptor) = decryptor else {
        return Err(CoreError::permanent(
            "DecryptFailed",
            CommandError::new_from_safe_message("ciphertext is passphrase-encrypted, expected recipient-encrypted".to_string()),
        ));
    };

    let identities: Vec<&dyn age::Identity> = vec![&identity.0];
    let mut reader = decryptor
        .decrypt(identities.into_iter())
        .map_err(|err| CoreError::permanent("DecryptFailed", CommandError::new_from_safe_message(err.to_string())))?;

    let mut plaintext = Vec::new();
    reader
        .read_to_end(&mut plaintext)
        .map_err(|err| CoreError::permanent("DecryptFailed", CommandError::from(err)))?;
    Ok(plaintext)
}

/// Parses the constrained CUE subset `secrets.cue` uses:
/// `"<path>": "<armored ciphertext>"` or `"<path>": """<armored ciphertext>"""`
/// entries inside a top-level `secrets: { ... }` struct.
pub fn parse_secrets_index(text: &str) -> Result<SecretsIndex, CoreError> {
    let mut entries = BTreeMap::new();
    let mut lines = text.lines().peekable();

    while let Some(line) = lines.next() {
        let trimmed = line.trim();
        let Some(rest) = trimmed.strip_prefix('"') else { continue };
        let Some(end_quote) = rest.find('"') else { continue };
        let key = &rest[..end_quote];
        let after_key = &rest[end_quote + 1..];
        let Some(value_part) = after_key.trim_start().strip_prefix(':') else { continue };
        let value_part = value_part.trim_start();

        if let Some(triple) = value_part.strip_prefix("\"\"\"") {
            let mut body = String::new();
            if let Some(end) = triple.find("\"\"\"") {
                body.push_str(&triple[..end]);
            } else {
                body.push_str(triple.trim_end());
                body.push('\n');
                for cont in lines.by_ref() {
                    if let Some(end) = cont.find("\"\"\"") {
                        body.push_str(&cont[..end]);
                        break;
                    }
                    body.push_str(cont);
                    body.push('\n');
                }
            }
            entries.insert(PathBuf::from(key), body.trim().to_string());
        } else if let Some(quoted) = value_part.strip_prefix('"') {
            if let Some(end) = quoted.find('"') {
                entries.insert(PathBuf::from(key), quoted[..end].to_string());
            }
        }
    }

    Ok(SecretsIndex { entries })
}

/// Parses `recipients.cue`'s top-level `recipients: [...]` string list.
pub fn parse_recipients(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let trimmed = line.trim().trim_end_matches(',');
            let trimmed = trimmed.strip_prefix('"')?;
            let end = trimmed.find('"')?;
            Some(trimmed[..end].to_string())
        })
        .filter(|s| s.starts_with("age1"))
        .collect()
}

async fn copy_dir_recursive(from: &Path, to: &Path) -> Result<(), CoreError> {
    let from = from.to_path_buf();
    let to = to.to_path_buf();
    tokio::task::spawn_blocking(move || copy_dir_recursive_blocking(&from, &to))
        .await
        .expect("copy task panicked")
}

fn copy_dir_recursive_blocking(from: &Path, to: &Path) -> Result<(), CoreError> {
    if to.exists() {
        std::fs::remove_dir_all(to)?;
    }
    std::fs::create_dir_all(to)?;
    for entry in walkdir::WalkDir::new(from).min_depth(1) {
        let entry = entry.map_err(|err| CoreError::permanent("CopyFailed", CommandError::new_from_safe_message(err.to_string())))?;
        let relative = entry.path().strip_prefix(from).expect("walkdir yields paths under root");
        let destination = to.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&destination)?;
        } else {
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &destination)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_line_and_triple_quoted_entries() {
        let text = r#"
secrets: {
    "apps/a/secret.yaml": "one-line-ciphertext"
    "apps/b/secret.yaml": """
    -----BEGIN AGE ENCRYPTED FILE-----
    abcd
    -----END AGE ENCRYPTED FILE-----
    """
}
"#;
        let index = parse_secrets_index(text).unwrap();
        assert_eq!(index.entries.len(), 2);
        assert_eq!(index.entries.get(&PathBuf::from("apps/a/secret.yaml")).unwrap(), "one-line-ciphertext");
        assert!(index.entries.get(&PathBuf::from("apps/b/secret.yaml")).unwrap().contains("BEGIN AGE ENCRYPTED FILE"));
    }

    #[test]
    fn parses_recipients_list() {
        let text = "recipients: [\n    \"age1ql3z7hjy54pw3hyww5ayyfg7zqgvc7w3j2elw8zmrj2kg5sfn9aqmcac8p\",\n]\n";
        let recipients = parse_recipients(text);
        assert_eq!(recipients.len(), 1);
        assert!(recipients[0].starts_with("age1"));
    }

    #[tokio::test]
    async fn round_trip_decryption_yields_original_plaintext() {
        let identity = age::x25519::Identity::generate();
        let recipient = identity.to_public();

        let plaintext = b"hunter2";
        let mut encrypted = Vec::new();
        {
            use std::io::Write;
            let armor_writer =
                age::armor::ArmoredWriter::wrap_output(&mut encrypted, age::armor::Format::AsciiArmor).unwrap();
            let encryptor = age::Encryptor::with_recipients(vec![Box::new(recipient)]).unwrap();
            let mut writer = encryptor.wrap_output(armor_writer).unwrap();
            writer.write_all(plaintext).unwrap();
            writer.finish().and_then(|armor| armor.finish()).unwrap();
        }
        let armored = String::from_utf8(encrypted).unwrap();

        let decrypted = decrypt_one(&Identity(identity), &armored).unwrap();
        assert_eq!(decrypted, plaintext);
    }
}
