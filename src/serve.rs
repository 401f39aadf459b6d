//! JSON-lines facade over stdin/stdout.
//!
//! Each input line is one request object tagged by `op`; each produces one
//! response line `{"id", "ok", "result" | "error"}`. Requests are handled in
//! order, with blocking service calls moved onto `spawn_blocking`.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    event_bus::DEFAULT_AWAIT_TIMEOUT,
    events::{IndexEvent, Reply},
    service::Service,
    task::Bucket,
    watcher::QueueWatcher,
};

const REBUILD_WAIT: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    PrepareSearch {
        query: String,
    },
    StartSearch {
        query: String,
    },
    StopSearch,
    Results {
        uuid: Uuid,
        #[serde(default)]
        bucket: Bucket,
        #[serde(default)]
        start_index: usize,
    },
    AddToCache {
        path: String,
    },
    RemoveFromCache {
        path: String,
    },
    UpdateIndex {
        #[serde(default)]
        drop_previous: bool,
        /// Block until the rebuild finishes instead of acknowledging it.
        #[serde(default)]
        wait: bool,
    },
    Optimize,
    AddSuffix {
        suffix: String,
        priority: i32,
    },
    DeleteSuffix {
        suffix: String,
    },
    UpdateSuffix {
        old_suffix: String,
        suffix: String,
        priority: i32,
    },
    ClearSuffix,
    FileAdded {
        path: String,
    },
    FileRemoved {
        path: String,
    },
    Status,
    Close,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<Value>,
    #[serde(flatten)]
    request: Request,
}

#[derive(Debug, Serialize)]
struct Response {
    id: Option<Value>,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Response {
    fn from_outcome(id: Option<Value>, outcome: Result<Value>) -> Self {
        match outcome {
            Ok(result) => Self {
                id,
                ok: true,
                result: Some(result),
                error: None,
            },
            Err(e) => Self {
                id,
                ok: false,
                result: None,
                error: Some(e.to_string()),
            },
        }
    }
}

async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> Result<T> + Send + 'static,
) -> Result<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Handler(format!("blocking call failed: {e}")))?
}

/// Publish `message` and wait for its handler.
fn publish_and_wait(
    service: &Service,
    message: IndexEvent,
) -> Result<Option<Reply>> {
    let event = service.bus().publish(message);
    if event.await_finished(DEFAULT_AWAIT_TIMEOUT) {
        return Err(match event.error() {
            Some(error) => Error::Handler(error),
            None => Error::Timeout("event"),
        });
    }
    Ok(event.reply())
}

fn task_page(reply: Option<Reply>) -> Result<Value> {
    let task = reply
        .ok_or_else(|| Error::Handler("search produced no task".into()))?;
    Ok(serde_json::to_value(task.page(Bucket::Fast, 0))?)
}

async fn dispatch(
    service: &Arc<Service>,
    watcher: &QueueWatcher,
    request: Request,
) -> Result<Value> {
    let service = service.clone();
    match request {
        Request::PrepareSearch { query } => {
            blocking(move || {
                let message = IndexEvent::PrepareSearch { query };
                task_page(publish_and_wait(&service, message)?)
            })
            .await
        }
        Request::StartSearch { query } => {
            blocking(move || {
                let message = IndexEvent::StartSearch { query };
                task_page(publish_and_wait(&service, message)?)
            })
            .await
        }
        Request::Results {
            uuid,
            bucket,
            start_index,
        } => {
            let page = service.results(&uuid, bucket, start_index).ok_or(
                Error::NotFound {
                    kind: "task",
                    name: uuid.to_string(),
                },
            )?;
            Ok(serde_json::to_value(page)?)
        }
        Request::UpdateIndex {
            drop_previous,
            wait: false,
        } => {
            service.request_update(drop_previous);
            Ok(json!({ "accepted": true }))
        }
        Request::UpdateIndex {
            drop_previous,
            wait: true,
        } => {
            blocking(move || {
                let event = service.request_update(drop_previous);
                if event.await_finished(REBUILD_WAIT) {
                    return Err(Error::Handler(
                        event.error().unwrap_or_else(|| "timed out".into()),
                    ));
                }
                Ok(Value::Null)
            })
            .await
        }
        Request::FileAdded { path } => {
            Ok(json!({ "accepted": watcher.notify_added(&path) }))
        }
        Request::FileRemoved { path } => {
            Ok(json!({ "accepted": watcher.notify_removed(&path) }))
        }
        Request::Status => Ok(serde_json::to_value(service.report())?),
        Request::Close => {
            blocking(move || service.close()).await?;
            Ok(Value::Null)
        }
        Request::StopSearch => relay(service, IndexEvent::StopSearch).await,
        Request::AddToCache { path } => {
            relay(service, IndexEvent::AddToCache(path)).await
        }
        Request::RemoveFromCache { path } => {
            relay(service, IndexEvent::RemoveFromCache(path)).await
        }
        Request::Optimize => relay(service, IndexEvent::Optimize).await,
        Request::AddSuffix { suffix, priority } => {
            relay(service, IndexEvent::AddSuffix { suffix, priority }).await
        }
        Request::DeleteSuffix { suffix } => {
            relay(service, IndexEvent::DeleteSuffix { suffix }).await
        }
        Request::UpdateSuffix {
            old_suffix,
            suffix,
            priority,
        } => {
            let message = IndexEvent::UpdateSuffix {
                old_suffix,
                suffix,
                priority,
            };
            relay(service, message).await
        }
        Request::ClearSuffix => {
            relay(service, IndexEvent::ClearSuffixes).await
        }
    }
}

async fn relay(service: Arc<Service>, message: IndexEvent) -> Result<Value> {
    blocking(move || publish_and_wait(&service, message)).await?;
    Ok(Value::Null)
}

/// Serve requests from `reader` until `close` or end of input. End of
/// input closes the service too.
pub async fn serve<R, W>(
    service: Arc<Service>,
    watcher: Arc<QueueWatcher>,
    reader: R,
    mut writer: W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let mut closed = false;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Envelope>(line) {
            Ok(Envelope { id, request }) => {
                closed = request == Request::Close;
                tracing::debug!(?request, "request");
                let outcome = dispatch(&service, &watcher, request).await;
                Response::from_outcome(id, outcome)
            }
            Err(e) => Response::from_outcome(None, Err(e.into())),
        };
        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        writer.write_all(&out).await?;
        writer.flush().await?;
        if closed {
            return Ok(());
        }
    }
    tracing::info!("input closed, shutting down");
    blocking(move || service.close()).await
}

/// Serve over the process's stdin and stdout on a fresh runtime.
pub fn run_stdio(
    service: Arc<Service>,
    watcher: Arc<QueueWatcher>,
) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| {
            Error::Config(format!("failed to start tokio runtime: {e}"))
        })?;
    runtime.block_on(async move {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        serve(service, watcher, stdin, tokio::io::stdout()).await
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        data_dir::DataDir,
        service::Collaborators,
    };

    async fn round_trip(input: &str) -> Vec<Value> {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = DataDir::resolve(Some(tmp.path())).unwrap();
        let config = Config {
            max_event_retries: 0,
            event_workers: 2,
            ..Config::default()
        };
        let watcher = Arc::new(QueueWatcher::new());
        let parts =
            Collaborators::from_config(&config).with_watcher(watcher.clone());
        let service = Service::open(data_dir, config, parts).unwrap();

        let mut out = Vec::new();
        serve(service, watcher, input.as_bytes(), &mut out)
            .await
            .unwrap();
        String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn one_response_per_request() {
        let long = "x".repeat(400);
        let input = format!(
            "{}\n{}\n\nnot json\n{}\n{}\n{}\n",
            r#"{"id": 1, "op": "addSuffix", "suffix": "RS", "priority": 4}"#,
            json!({ "id": 2, "op": "prepareSearch", "query": long }),
            r#"{"id": 3, "op": "fileAdded", "path": "/nowhere/a"}"#,
            r#"{"id": 4, "op": "status"}"#,
            r#"{"id": 5, "op": "close"}"#,
        );
        let responses = round_trip(&input).await;
        assert_eq!(responses.len(), 6);

        assert_eq!(responses[0]["ok"], json!(true));
        assert_eq!(responses[1]["id"], json!(2));
        assert_eq!(responses[1]["ok"], json!(false));
        assert_eq!(responses[2]["id"], Value::Null);
        assert_eq!(responses[2]["ok"], json!(false));
        assert_eq!(responses[3]["result"]["accepted"], json!(false));

        let status = &responses[4];
        assert_eq!(status["id"], json!(4));
        let suffixes = status["result"]["suffixes"].as_array().unwrap();
        assert!(suffixes.contains(&json!(["rs", 4])));
        assert_eq!(status["result"]["status"], json!("NORMAL"));
        let closed = json!({ "id": 5, "ok": true, "result": null });
        assert_eq!(responses[5], closed);
    }

    #[test]
    fn requests_parse_camel_case() {
        let envelope: Envelope = serde_json::from_str(
            r#"{"id": 7, "op": "updateSuffix", "oldSuffix": "txt",
                "suffix": "md", "priority": 2}"#,
        )
        .unwrap();
        assert_eq!(envelope.id, Some(json!(7)));
        assert_eq!(
            envelope.request,
            Request::UpdateSuffix {
                old_suffix: "txt".into(),
                suffix: "md".into(),
                priority: 2,
            }
        );

        let uuid = Uuid::new_v4();
        let request: Request = serde_json::from_value(
            json!({ "op": "results", "uuid": uuid, "bucket": "fast" }),
        )
        .unwrap();
        assert_eq!(
            request,
            Request::Results {
                uuid,
                bucket: Bucket::Fast,
                start_index: 0,
            }
        );
        assert!(serde_json::from_str::<Request>(r#"{"op": "nope"}"#).is_err());
    }

    #[test]
    fn error_responses_carry_the_message() {
        let response = Response::from_outcome(
            Some(json!("a")),
            Err(Error::InvalidQuery("empty".into())),
        );
        let line = serde_json::to_value(&response).unwrap();
        assert_eq!(line["ok"], json!(false));
        assert_eq!(line["id"], json!("a"));
        assert_eq!(line["error"], json!("invalid query: empty"));
        assert!(line.get("result").is_none());
    }
}
