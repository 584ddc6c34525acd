use super::{JobQueue, QueueError};
use crate::dispatcher::Job;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use url::Url;

/// Posts each job as JSON to a broker endpoint. Any 2xx answer means the
/// broker has taken the job.
pub struct HttpQueue {
    client: Client,
    endpoint: Url,
}

impl HttpQueue {
    pub fn new(endpoint: &str, timeout_seconds: u64) -> anyhow::Result<Self> {
        let endpoint = Url::parse(endpoint)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .user_agent(concat!("mailgate/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl JobQueue for HttpQueue {
    async fn submit(&self, job: &Job) -> Result<(), QueueError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(job)
            .send()
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            log::debug!("Queue accepted {} job ({status})", job.kind());
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(QueueError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::JobPayload;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP endpoint answering every request with `status_line`,
    /// returning the request it received.
    async fn one_shot_server(status_line: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/jobs", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if request.len() >= split + 4 + length {
                        break;
                    }
                }
            }
            let response = format!("HTTP/1.1 {status_line}\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok");
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });

        (url, handle)
    }

    fn job() -> Job {
        Job::new(JobPayload::VisitorView {
            slug: "alice".to_string(),
            domain: "example.com".to_string(),
            raw_mail: Arc::from(&b"Subject: hi\r\n\r\nbody\r\n"[..]),
        })
    }

    #[tokio::test]
    async fn test_submit_posts_job_json() {
        let (url, server) = one_shot_server("201 Created").await;
        let queue = HttpQueue::new(&url, 5).unwrap();

        queue.submit(&job()).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /jobs HTTP/1.1"));
        assert!(request.contains("\"kind\":\"mail.visitor_view\""));
        assert!(request.contains("\"priority\":2"));
    }

    #[tokio::test]
    async fn test_non_success_status_is_rejection() {
        let (url, _server) = one_shot_server("503 Service Unavailable").await;
        let queue = HttpQueue::new(&url, 5).unwrap();

        let result = queue.submit(&job()).await;
        assert!(matches!(result, Err(QueueError::Rejected { status: 503, .. })));
    }

    #[tokio::test]
    async fn test_unreachable_broker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/jobs", listener.local_addr().unwrap());
        drop(listener);

        let queue = HttpQueue::new(&url, 2).unwrap();
        assert!(matches!(
            queue.submit(&job()).await,
            Err(QueueError::Unavailable(_))
        ));
    }
}
