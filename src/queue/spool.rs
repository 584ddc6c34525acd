use super::{JobQueue, QueueError};
use crate::dispatcher::Job;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Writes each job as a JSON file into a directory watched by the consumer.
///
/// File names start with the priority rank so a lexical listing yields the
/// consumption order. Files appear atomically through a rename.
pub struct SpoolQueue {
    dir: PathBuf,
}

impl SpoolQueue {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn prepare(&self) -> Result<(), QueueError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for SpoolQueue {
    async fn submit(&self, job: &Job) -> Result<(), QueueError> {
        let encoded = serde_json::to_vec(job)?;

        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let name = format!("{}-{millis:013}-{}.json", job.priority().rank(), Uuid::new_v4());

        let final_path = self.dir.join(&name);
        let temp_path = self.dir.join(format!(".{name}.tmp"));

        publish(&temp_path, &final_path, &encoded).await?;

        log::debug!("Spooled {} job to {}", job.kind(), final_path.display());
        Ok(())
    }
}

/// Write `contents` to `temp_path` and rename it into place. The temp file
/// never outlives a failure.
async fn publish(temp_path: &Path, final_path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let written = match tokio::fs::write(temp_path, contents).await {
        Ok(()) => tokio::fs::rename(temp_path, final_path).await,
        Err(e) => Err(e),
    };
    if written.is_err() {
        let _ = tokio::fs::remove_file(temp_path).await;
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::JobPayload;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_jobs_are_written_in_priority_order() {
        let dir = tempfile::tempdir().unwrap();
        let queue = SpoolQueue::new(dir.path().join("jobs"));
        queue.prepare().await.unwrap();

        let body: Arc<[u8]> = Arc::from(&b"raw"[..]);
        let visitor = Job::new(JobPayload::VisitorView {
            slug: "v".to_string(),
            domain: "example.com".to_string(),
            raw_mail: body.clone(),
        });
        let member = Job::new(JobPayload::MemberView {
            slug: "m".to_string(),
            username: "u".to_string(),
            domain: "example.com".to_string(),
            raw_mail: body,
        });

        queue.submit(&visitor).await.unwrap();
        queue.submit(&member).await.unwrap();

        let mut names: Vec<String> = std::fs::read_dir(queue.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();

        assert_eq!(names.len(), 2, "no temp files left behind: {names:?}");
        assert!(names[0].starts_with("1-"));
        assert!(names[1].starts_with("2-"));

        let first: serde_json::Value =
            serde_json::from_slice(&std::fs::read(queue.dir().join(&names[0])).unwrap()).unwrap();
        assert_eq!(first["kind"], "mail.member_view");
        assert_eq!(first["data"]["username"], "u");
    }

    #[tokio::test]
    async fn test_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let queue = SpoolQueue::new(dir.path().join("never-created"));
        let job = Job::new(JobPayload::VisitorView {
            slug: "v".to_string(),
            domain: "example.com".to_string(),
            raw_mail: Arc::from(&b"raw"[..]),
        });
        assert!(matches!(queue.submit(&job).await, Err(QueueError::Io(_))));
    }

    #[tokio::test]
    async fn test_failed_rename_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let temp_path = dir.path().join(".job.json.tmp");
        // a non-empty directory cannot be replaced by a file
        let final_path = dir.path().join("job.json");
        std::fs::create_dir_all(final_path.join("occupied")).unwrap();

        assert!(publish(&temp_path, &final_path, b"{}").await.is_err());
        assert!(!temp_path.exists());
        assert!(final_path.is_dir());
    }
}
