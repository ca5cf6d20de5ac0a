//! Live notification feed over the realtime websocket.
//!
//! One socket per subscription, speaking the Phoenix channel protocol: join
//! `realtime:notifications:<user_id>` with a `postgres_changes` filter on the
//! user's rows, heartbeat every 30 seconds, and forward row changes as
//! [`NotificationEvent`]s.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::model::Notification;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const PROTOCOL_VERSION: &str = "1.0.0";
const CHANNEL_BUFFER: usize = 64;
const JOIN_REF: u64 = 1;

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("invalid realtime url: {0}")]
    Url(#[from] url::ParseError),
    #[error("unsupported url scheme {0}")]
    Scheme(String),
    #[error("websocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("malformed frame: {0}")]
    Frame(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum NotificationEvent {
    Inserted(Notification),
    Updated(Notification),
    Deleted { id: Option<Uuid> },
}

/// A decoded server frame.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Incoming {
    Reply { reference: Option<String>, ok: bool, response: Value },
    Change(NotificationEvent),
    Closed,
    Other,
}

impl Incoming {
    /// The server refused the channel join; nothing will ever arrive.
    pub(crate) fn is_join_rejection(&self) -> bool {
        let join_ref = JOIN_REF.to_string();
        matches!(self, Incoming::Reply { ok: false, reference: Some(r), .. } if *r == join_ref)
    }
}

pub fn websocket_url(project_url: &Url, anon_key: &str) -> Result<Url, RealtimeError> {
    let mut url = project_url.join("realtime/v1/websocket")?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(RealtimeError::Scheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|_| RealtimeError::Scheme(scheme.to_string()))?;
    url.query_pairs_mut()
        .append_pair("apikey", anon_key)
        .append_pair("vsn", PROTOCOL_VERSION);
    Ok(url)
}

pub fn channel_topic(user_id: Uuid) -> String {
    format!("realtime:notifications:{}", user_id)
}

pub(crate) fn join_frame(user_id: Uuid, access_token: &str, reference: u64) -> Value {
    let reference = reference.to_string();
    json!({
        "topic": channel_topic(user_id),
        "event": "phx_join",
        "payload": {
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [{
                    "event": "*",
                    "schema": "public",
                    "table": "notifications",
                    "filter": format!("user_id=eq.{}", user_id),
                }],
            },
            "access_token": access_token,
        },
        "ref": reference,
        "join_ref": reference,
    })
}

pub(crate) fn heartbeat_frame(reference: u64) -> Value {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": reference.to_string(),
    })
}

pub(crate) fn leave_frame(user_id: Uuid, reference: u64) -> Value {
    json!({
        "topic": channel_topic(user_id),
        "event": "phx_leave",
        "payload": {},
        "ref": reference.to_string(),
    })
}

pub(crate) fn parse_frame(text: &str) -> Result<Incoming, RealtimeError> {
    let frame: Value = serde_json::from_str(text)?;
    let event = frame.get("event").and_then(Value::as_str).unwrap_or_default();
    let payload = frame.get("payload").cloned().unwrap_or(Value::Null);
    match event {
        "phx_reply" => Ok(Incoming::Reply {
            reference: frame.get("ref").and_then(Value::as_str).map(str::to_string),
            ok: payload.get("status").and_then(Value::as_str) == Some("ok"),
            response: payload.get("response").cloned().unwrap_or(Value::Null),
        }),
        "phx_close" | "phx_error" => Ok(Incoming::Closed),
        "postgres_changes" => {
            let data = payload.get("data").cloned().unwrap_or(Value::Null);
            let kind = data.get("type").and_then(Value::as_str).unwrap_or_default();
            let record = || data.get("record").cloned().unwrap_or(Value::Null);
            let event = match kind {
                "INSERT" => NotificationEvent::Inserted(serde_json::from_value(record())?),
                "UPDATE" => NotificationEvent::Updated(serde_json::from_value(record())?),
                "DELETE" => NotificationEvent::Deleted {
                    id: data
                        .get("old_record")
                        .and_then(|r| r.get("id"))
                        .and_then(Value::as_str)
                        .and_then(|s| Uuid::parse_str(s).ok()),
                },
                _ => return Ok(Incoming::Other),
            };
            Ok(Incoming::Change(event))
        }
        _ => Ok(Incoming::Other),
    }
}

#[derive(Debug, Clone)]
pub struct NotificationFeed {
    url: Url,
    access_token: String,
}

impl NotificationFeed {
    /// `access_token` defaults to the anon key when the caller has no
    /// hosted session.
    pub fn new(project_url: &Url, anon_key: &str, access_token: Option<String>) -> Result<Self, RealtimeError> {
        Ok(Self {
            url: websocket_url(project_url, anon_key)?,
            access_token: access_token.unwrap_or_else(|| anon_key.to_string()),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub async fn subscribe(&self, user_id: Uuid) -> Result<NotificationSubscription, RealtimeError> {
        let (mut ws, _) = connect_async(self.url.as_str()).await?;
        ws.send(Message::Text(join_frame(user_id, &self.access_token, JOIN_REF).to_string()))
            .await?;
        debug!(%user_id, "notification channel join sent");

        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut next_ref: u64 = 2;
            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            heartbeat.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        let _ = ws.send(Message::Text(leave_frame(user_id, next_ref).to_string())).await;
                        let _ = ws.close(None).await;
                        debug!(%user_id, "notification channel left");
                        break;
                    }
                    _ = heartbeat.tick() => {
                        if let Err(err) = ws.send(Message::Text(heartbeat_frame(next_ref).to_string())).await {
                            warn!(?err, "heartbeat failed");
                            break;
                        }
                        next_ref += 1;
                    }
                    msg = ws.next() => {
                        let text = match msg {
                            Some(Ok(Message::Text(text))) => text,
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => continue,
                            Some(Err(err)) => {
                                warn!(?err, "notification socket error");
                                break;
                            }
                        };
                        match parse_frame(&text) {
                            Ok(frame) if frame.is_join_rejection() => {
                                if let Incoming::Reply { response, .. } = frame {
                                    warn!(%user_id, %response, "notification channel join refused");
                                }
                                break;
                            }
                            Ok(Incoming::Change(event)) => {
                                if tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Ok(Incoming::Reply { ok: false, response, .. }) => {
                                warn!(%response, "realtime request rejected");
                            }
                            Ok(Incoming::Reply { ok: true, reference, .. }) => {
                                if reference.as_deref() == Some("1") {
                                    info!(%user_id, "notification channel joined");
                                } else {
                                    debug!(?reference, "realtime ack");
                                }
                            }
                            Ok(Incoming::Closed) => break,
                            Ok(Incoming::Other) => {}
                            Err(err) => debug!(?err, "ignoring frame"),
                        }
                    }
                }
            }
        });

        Ok(NotificationSubscription {
            user_id,
            events: rx,
            stop: Some(stop_tx),
            task: Some(task),
        })
    }
}

/// Live handle; dropping it leaves the channel and closes the socket.
#[derive(Debug)]
pub struct NotificationSubscription {
    user_id: Uuid,
    events: mpsc::Receiver<NotificationEvent>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl NotificationSubscription {
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    /// `None` once the socket is gone.
    pub async fn recv(&mut self) -> Option<NotificationEvent> {
        self.events.recv().await
    }

    /// Leave the channel and wait for the socket task to finish.
    pub async fn close(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for NotificationSubscription {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_follows_project_scheme() {
        let base = Url::parse("https://abc.supabase.co/").unwrap();
        let url = websocket_url(&base, "anon").unwrap();
        assert_eq!(
            url.as_str(),
            "wss://abc.supabase.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );

        let local = Url::parse("http://localhost:54321/").unwrap();
        assert_eq!(websocket_url(&local, "k").unwrap().scheme(), "ws");
    }

    #[test]
    fn join_frame_filters_by_user() {
        let user = Uuid::new_v4();
        let frame = join_frame(user, "token", 1);
        assert_eq!(frame["topic"], format!("realtime:notifications:{}", user));
        assert_eq!(frame["event"], "phx_join");
        let change = &frame["payload"]["config"]["postgres_changes"][0];
        assert_eq!(change["table"], "notifications");
        assert_eq!(change["filter"], format!("user_id=eq.{}", user));
        assert_eq!(frame["payload"]["access_token"], "token");
    }

    #[test]
    fn parses_change_frames() {
        let user = Uuid::new_v4();
        let id = Uuid::new_v4();
        let insert = json!({
            "topic": channel_topic(user),
            "event": "postgres_changes",
            "payload": { "data": {
                "type": "INSERT",
                "table": "notifications",
                "record": {
                    "id": id, "user_id": user, "title": "Nouvelle inscription",
                    "message": "Une demande attend", "is_read": false,
                    "created_at": "2024-09-02T10:00:00Z"
                }
            }},
            "ref": null
        });
        match parse_frame(&insert.to_string()).unwrap() {
            Incoming::Change(NotificationEvent::Inserted(n)) => {
                assert_eq!(n.id, id);
                assert_eq!(n.kind, "info");
            }
            other => panic!("unexpected {:?}", other),
        }

        let delete = json!({
            "event": "postgres_changes",
            "payload": { "data": { "type": "DELETE", "old_record": { "id": id } } }
        });
        assert_eq!(
            parse_frame(&delete.to_string()).unwrap(),
            Incoming::Change(NotificationEvent::Deleted { id: Some(id) })
        );
    }

    #[test]
    fn parses_replies() {
        let ok = json!({"event": "phx_reply", "ref": "1", "payload": {"status": "ok", "response": {}}});
        assert!(matches!(
            parse_frame(&ok.to_string()).unwrap(),
            Incoming::Reply { ok: true, .. }
        ));
        let err = json!({"event": "phx_reply", "ref": "1", "payload": {"status": "error", "response": {"reason": "denied"}}});
        assert!(matches!(
            parse_frame(&err.to_string()).unwrap(),
            Incoming::Reply { ok: false, .. }
        ));
        let hb = heartbeat_frame(7);
        assert_eq!(hb["topic"], "phoenix");
        assert_eq!(hb["ref"], "7");
        assert_eq!(parse_frame(r#"{"event":"presence_state"}"#).unwrap(), Incoming::Other);
    }

    #[test]
    fn only_a_refused_join_is_fatal() {
        let refused = json!({"event": "phx_reply", "ref": "1", "payload": {"status": "error", "response": {"reason": "unauthorized"}}});
        assert!(parse_frame(&refused.to_string()).unwrap().is_join_rejection());

        let heartbeat_err = json!({"event": "phx_reply", "ref": "4", "payload": {"status": "error", "response": {}}});
        assert!(!parse_frame(&heartbeat_err.to_string()).unwrap().is_join_rejection());

        let joined = json!({"event": "phx_reply", "ref": "1", "payload": {"status": "ok", "response": {}}});
        assert!(!parse_frame(&joined.to_string()).unwrap().is_join_rejection());
    }

    #[tokio::test]
    async fn refused_join_ends_the_feed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let join = ws.next().await.unwrap().unwrap();
            let join: Value = serde_json::from_str(join.to_text().unwrap()).unwrap();
            assert_eq!(join["event"], "phx_join");
            let reply = json!({
                "topic": join["topic"], "event": "phx_reply", "ref": "1",
                "payload": {"status": "error", "response": {"reason": "unauthorized"}}
            });
            ws.send(Message::Text(reply.to_string())).await.unwrap();
            // Hold the socket open; the client must hang up on its own.
            while let Some(Ok(_)) = ws.next().await {}
        });

        let project = Url::parse(&format!("http://{}/", addr)).unwrap();
        let feed = NotificationFeed::new(&project, "anon", None).unwrap();
        let mut sub = feed.subscribe(Uuid::new_v4()).await.unwrap();
        let next = tokio::time::timeout(Duration::from_secs(5), sub.recv()).await.unwrap();
        assert!(next.is_none());
        drop(sub);
        server.await.unwrap();
    }
}
