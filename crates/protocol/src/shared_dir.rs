use crate::{CommandDocument, DocumentIdentity, ResultDocument, Status};
use anyhow::Context;
use serde::Serialize;
use serde_json::Value;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

pub const COMMAND_FILE: &str = "bridge_command.json";
pub const RESULT_FILE: &str = "bridge_result.json";
pub const HISTORY_FILE: &str = "bridge_history.json";
pub const SCRIPTS_DIR: &str = "scripts";

/// The directory both sides agree on. It holds exactly one Command Document
/// and one Result Document, plus staged scripts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedDir {
    root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    Applied,
    /// The slot now holds a different document; nothing was written.
    Replaced { found: DocumentIdentity },
    Missing,
}

impl SharedDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn command_path(&self) -> PathBuf {
        self.root.join(COMMAND_FILE)
    }

    pub fn result_path(&self) -> PathBuf {
        self.root.join(RESULT_FILE)
    }

    pub fn default_history_path(&self) -> PathBuf {
        self.root.join(HISTORY_FILE)
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.root.join(SCRIPTS_DIR)
    }

    /// Resolves a staged script name, refusing anything that would leave the
    /// scripts directory.
    pub fn script_path(&self, name: &str) -> anyhow::Result<PathBuf> {
        let relative = Path::new(name);
        let plain = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if name.trim().is_empty() || !plain {
            anyhow::bail!("invalid script name: {name}");
        }
        Ok(self.scripts_dir().join(relative))
    }

    pub async fn ensure(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(self.scripts_dir())
            .await
            .with_context(|| format!("failed to create {}", self.scripts_dir().display()))
    }

    pub async fn write_command(&self, document: &CommandDocument) -> anyhow::Result<()> {
        write_json_atomic(&self.command_path(), document).await
    }

    pub async fn write_result(&self, document: &ResultDocument) -> anyhow::Result<()> {
        write_json_atomic(&self.result_path(), document).await
    }

    pub async fn read_command_value(&self) -> anyhow::Result<Option<Value>> {
        read_json_value(&self.command_path()).await
    }

    pub async fn read_command(&self) -> anyhow::Result<Option<CommandDocument>> {
        let Some(value) = self.read_command_value().await? else {
            return Ok(None);
        };
        let document = serde_json::from_value(value).with_context(|| {
            format!("invalid command document {}", self.command_path().display())
        })?;
        Ok(Some(document))
    }

    /// Raw result text plus its modification time.
    pub async fn read_result_raw(&self) -> anyhow::Result<Option<(String, SystemTime)>> {
        let path = self.result_path();
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to stat {}", path.display()))
            }
        };
        let modified = metadata
            .modified()
            .with_context(|| format!("no modification time for {}", path.display()))?;
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        Ok(Some((raw, modified)))
    }

    /// Read-modify-write of the `status` field. Only legal transitions are
    /// written, and only while the slot still holds `expected`.
    pub async fn update_status(
        &self,
        expected: &DocumentIdentity,
        next: Status,
    ) -> anyhow::Result<StatusUpdate> {
        let Some(mut value) = self.read_command_value().await? else {
            return Ok(StatusUpdate::Missing);
        };
        let found = DocumentIdentity::from_value(&value);
        if &found != expected {
            return Ok(StatusUpdate::Replaced { found });
        }
        let current = value
            .get("status")
            .and_then(Value::as_str)
            .and_then(Status::parse)
            .ok_or_else(|| anyhow::anyhow!("command document has no valid status"))?;
        if !current.can_transition_to(next) {
            anyhow::bail!("illegal status transition {current} -> {next}");
        }
        let Some(object) = value.as_object_mut() else {
            anyhow::bail!("command document is not a JSON object");
        };
        object.insert("status".to_string(), Value::String(next.as_str().to_string()));
        write_json_atomic(&self.command_path(), &value).await?;
        Ok(StatusUpdate::Applied)
    }
}

async fn read_json_value(path: &Path) -> anyhow::Result<Option<Value>> {
    let payload = match tokio::fs::read(path).await {
        Ok(payload) => payload,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", path.display())),
    };
    let value = serde_json::from_slice(&payload)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(value))
}

/// Whole-file replacement: the payload goes to a sibling temporary file which
/// is then renamed over the target, so readers never see a partial document.
/// The parent directory must already exist.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    let payload = serde_json::to_vec_pretty(value)?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow::anyhow!("invalid document path {}", path.display()))?;
    let temp = path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));
    tokio::fs::write(&temp, payload)
        .await
        .with_context(|| format!("failed to write {}", temp.display()))?;
    if let Err(err) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(err).with_context(|| format!("failed to replace {}", path.display()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{now_timestamp, BatchCommand, JsonObject};

    fn batch(tools: &[&str]) -> CommandDocument {
        let commands = tools
            .iter()
            .enumerate()
            .map(|(index, tool)| BatchCommand {
                command_id: format!("c{index}"),
                tool: tool.to_string(),
                args: JsonObject::new(),
            })
            .collect();
        CommandDocument::pending(commands, now_timestamp()).expect("document")
    }

    #[tokio::test]
    async fn missing_documents_read_as_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = SharedDir::new(temp.path());
        assert!(dir.read_command().await.expect("read").is_none());
        assert!(dir.read_result_raw().await.expect("read").is_none());
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temporary_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = SharedDir::new(temp.path());
        dir.write_command(&batch(&["a", "b"])).await.expect("write");
        dir.write_command(&batch(&["c"])).await.expect("overwrite");
        let names: Vec<String> = std::fs::read_dir(temp.path())
            .expect("list")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec![COMMAND_FILE.to_string()]);
        let doc = dir.read_command().await.expect("read").expect("doc");
        assert!(matches!(doc, CommandDocument::Single(_)));
    }

    #[tokio::test]
    async fn write_fails_when_directory_is_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = SharedDir::new(temp.path().join("missing"));
        assert!(dir.write_command(&batch(&["a"])).await.is_err());
    }

    #[tokio::test]
    async fn status_update_walks_the_lifecycle() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = SharedDir::new(temp.path());
        let doc = batch(&["a", "b"]);
        dir.write_command(&doc).await.expect("write");
        let identity = doc.identity();

        assert_eq!(
            dir.update_status(&identity, Status::Running).await.expect("running"),
            StatusUpdate::Applied
        );
        assert!(dir.update_status(&identity, Status::Pending).await.is_err());
        assert_eq!(
            dir.update_status(&identity, Status::Completed).await.expect("completed"),
            StatusUpdate::Applied
        );
        let stored = dir.read_command().await.expect("read").expect("doc");
        assert_eq!(stored.status(), Status::Completed);
        assert_eq!(stored.identity(), identity);
    }

    #[tokio::test]
    async fn status_update_skips_an_overwritten_slot() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = SharedDir::new(temp.path());
        let first = batch(&["a", "b"]);
        dir.write_command(&first).await.expect("write");
        dir.update_status(&first.identity(), Status::Running)
            .await
            .expect("running");

        let second = batch(&["c", "d"]);
        dir.write_command(&second).await.expect("overwrite");

        let update = dir
            .update_status(&first.identity(), Status::Completed)
            .await
            .expect("update");
        assert_eq!(
            update,
            StatusUpdate::Replaced {
                found: second.identity()
            }
        );
        let stored = dir.read_command().await.expect("read").expect("doc");
        assert_eq!(stored.status(), Status::Pending);
    }

    #[test]
    fn script_names_cannot_escape() {
        let dir = SharedDir::new("/tmp/bridge");
        assert!(dir.script_path("render.sh").is_ok());
        assert!(dir.script_path("nested/render.sh").is_ok());
        assert!(dir.script_path("../outside.sh").is_err());
        assert!(dir.script_path("/etc/passwd").is_err());
        assert!(dir.script_path("").is_err());
    }
}
