//! Cluster-wide event bus on `PostgreSQL` `LISTEN`/`NOTIFY`.
//!
//! Every node publishes domain events with `pg_notify` on one fixed channel
//! and holds a dedicated listener connection on the same channel. Received
//! envelopes are re-dispatched on a local broadcast channel, so subscribers
//! cannot tell a remote event from a locally-raised one.
//!
//! Delivery is at-most-once and unordered across nodes: a disconnected node
//! misses events published during the outage. These are ephemeral real-time
//! hints, not a durable log.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use kazari_common::{AppError, AppResult};
use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection, Statement};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The single notification channel all nodes share.
pub const EVENT_CHANNEL: &str = "kazari_event";

/// Backoff after a listener error before reconnecting.
const LISTEN_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Note event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotePayload {
    pub id: String,
    pub user_id: String,
    pub text: Option<String>,
    pub visibility: String,
}

/// A user acting on a note (like, reaction).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteInteraction {
    pub note_id: String,
    pub user_id: String,
    /// Reaction string; `None` for plain likes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaction: Option<String>,
}

/// A user acting on another user (follow, block, mute).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInteraction {
    pub actor_id: String,
    pub target_id: String,
}

/// Notification event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub id: String,
    pub user_id: String,
    pub notification_type: String,
    pub source_user_id: Option<String>,
    pub note_id: Option<String>,
}

/// Word-filter event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterPayload {
    pub id: String,
    pub user_id: String,
}

/// User-list membership change payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListMembersPayload {
    pub list_id: String,
    pub user_id: String,
}

/// The tagged envelope published on [`EVENT_CHANNEL`].
///
/// The wire format is self-describing JSON (`type` discriminator plus the
/// payload's fields), so nodes briefly running different versions during a
/// rolling upgrade can still parse each other's events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StreamingEvent {
    NotePublished(NotePayload),
    NoteUpdated(NotePayload),
    NoteDeleted(NotePayload),
    NoteLiked(NoteInteraction),
    NoteUnliked(NoteInteraction),
    NoteReacted(NoteInteraction),
    NoteUnreacted(NoteInteraction),
    UserFollowed(UserInteraction),
    UserUnfollowed(UserInteraction),
    UserBlocked(UserInteraction),
    UserUnblocked(UserInteraction),
    UserMuted(UserInteraction),
    UserUnmuted(UserInteraction),
    NotificationCreated(NotificationPayload),
    FilterAdded(FilterPayload),
    FilterRemoved(FilterPayload),
    FilterUpdated(FilterPayload),
    ListMembersUpdated(ListMembersPayload),
}

/// Cluster event bus handle.
///
/// Cheap to clone; all clones share one local broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    db: Arc<DatabaseConnection>,
    local_tx: broadcast::Sender<StreamingEvent>,
}

impl EventBus {
    /// Create an event bus over an existing database connection pool.
    #[must_use]
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        let (local_tx, _) = broadcast::channel(1024);
        Self { db, local_tx }
    }

    /// Subscribe to events received by this node (local and remote alike).
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StreamingEvent> {
        self.local_tx.subscribe()
    }

    /// Number of local subscribers.
    #[must_use]
    pub fn local_subscriber_count(&self) -> usize {
        self.local_tx.receiver_count()
    }

    /// Publish an event to every node, this one included.
    ///
    /// Local delivery happens through the same listener round-trip as remote
    /// delivery; this method does not short-circuit the broadcast channel.
    pub async fn publish(&self, event: &StreamingEvent) -> AppResult<()> {
        let payload = serde_json::to_string(event)?;
        self.db
            .execute(Statement::from_sql_and_values(
                DatabaseBackend::Postgres,
                "SELECT pg_notify($1, $2)",
                [EVENT_CHANNEL.into(), payload.into()],
            ))
            .await
            .map_err(|e| AppError::EventBus(e.to_string()))?;
        debug!(?event, "Published cluster event");
        Ok(())
    }

    pub async fn raise_note_published(&self, note: NotePayload) -> AppResult<()> {
        self.publish(&StreamingEvent::NotePublished(note)).await
    }

    pub async fn raise_note_updated(&self, note: NotePayload) -> AppResult<()> {
        self.publish(&StreamingEvent::NoteUpdated(note)).await
    }

    pub async fn raise_note_deleted(&self, note: NotePayload) -> AppResult<()> {
        self.publish(&StreamingEvent::NoteDeleted(note)).await
    }

    pub async fn raise_note_liked(&self, note_id: &str, user_id: &str) -> AppResult<()> {
        self.publish(&StreamingEvent::NoteLiked(NoteInteraction {
            note_id: note_id.to_string(),
            user_id: user_id.to_string(),
            reaction: None,
        }))
        .await
    }

    pub async fn raise_note_unliked(&self, note_id: &str, user_id: &str) -> AppResult<()> {
        self.publish(&StreamingEvent::NoteUnliked(NoteInteraction {
            note_id: note_id.to_string(),
            user_id: user_id.to_string(),
            reaction: None,
        }))
        .await
    }

    pub async fn raise_note_reacted(
        &self,
        note_id: &str,
        user_id: &str,
        reaction: &str,
    ) -> AppResult<()> {
        self.publish(&StreamingEvent::NoteReacted(NoteInteraction {
            note_id: note_id.to_string(),
            user_id: user_id.to_string(),
            reaction: Some(reaction.to_string()),
        }))
        .await
    }

    pub async fn raise_note_unreacted(
        &self,
        note_id: &str,
        user_id: &str,
        reaction: &str,
    ) -> AppResult<()> {
        self.publish(&StreamingEvent::NoteUnreacted(NoteInteraction {
            note_id: note_id.to_string(),
            user_id: user_id.to_string(),
            reaction: Some(reaction.to_string()),
        }))
        .await
    }

    pub async fn raise_user_followed(&self, actor_id: &str, target_id: &str) -> AppResult<()> {
        self.publish(&StreamingEvent::UserFollowed(interaction(actor_id, target_id)))
            .await
    }

    pub async fn raise_user_unfollowed(&self, actor_id: &str, target_id: &str) -> AppResult<()> {
        self.publish(&StreamingEvent::UserUnfollowed(interaction(actor_id, target_id)))
            .await
    }

    pub async fn raise_user_blocked(&self, actor_id: &str, target_id: &str) -> AppResult<()> {
        self.publish(&StreamingEvent::UserBlocked(interaction(actor_id, target_id)))
            .await
    }

    pub async fn raise_user_unblocked(&self, actor_id: &str, target_id: &str) -> AppResult<()> {
        self.publish(&StreamingEvent::UserUnblocked(interaction(actor_id, target_id)))
            .await
    }

    pub async fn raise_user_muted(&self, actor_id: &str, target_id: &str) -> AppResult<()> {
        self.publish(&StreamingEvent::UserMuted(interaction(actor_id, target_id)))
            .await
    }

    pub async fn raise_user_unmuted(&self, actor_id: &str, target_id: &str) -> AppResult<()> {
        self.publish(&StreamingEvent::UserUnmuted(interaction(actor_id, target_id)))
            .await
    }

    pub async fn raise_notification_created(
        &self,
        notification: NotificationPayload,
    ) -> AppResult<()> {
        self.publish(&StreamingEvent::NotificationCreated(notification))
            .await
    }

    pub async fn raise_filter_added(&self, id: &str, user_id: &str) -> AppResult<()> {
        self.publish(&StreamingEvent::FilterAdded(filter(id, user_id)))
            .await
    }

    pub async fn raise_filter_removed(&self, id: &str, user_id: &str) -> AppResult<()> {
        self.publish(&StreamingEvent::FilterRemoved(filter(id, user_id)))
            .await
    }

    pub async fn raise_filter_updated(&self, id: &str, user_id: &str) -> AppResult<()> {
        self.publish(&StreamingEvent::FilterUpdated(filter(id, user_id)))
            .await
    }

    pub async fn raise_list_members_updated(&self, list_id: &str, user_id: &str) -> AppResult<()> {
        self.publish(&StreamingEvent::ListMembersUpdated(ListMembersPayload {
            list_id: list_id.to_string(),
            user_id: user_id.to_string(),
        }))
        .await
    }

    /// Run the listener loop until cancelled.
    ///
    /// Holds a dedicated connection subscribed to [`EVENT_CHANNEL`] and
    /// re-dispatches every received envelope on the local broadcast channel.
    /// Subscribing and receiving are both retried quietly: one warning per
    /// outage, not one per attempt, and a failure at startup is retried the
    /// same as a dropped connection mid-run.
    pub async fn listen(&self, shutdown: CancellationToken) {
        let pool = self.db.get_postgres_connection_pool();
        let mut degraded = false;
        loop {
            let mut listener = match connect_and_listen(pool).await {
                Ok(listener) => listener,
                Err(e) => {
                    if !degraded {
                        warn!(error = %e, "Cluster event listener cannot subscribe; retrying");
                        degraded = true;
                    }
                    tokio::select! {
                        () = tokio::time::sleep(LISTEN_RETRY_INTERVAL) => continue,
                        () = shutdown.cancelled() => {
                            info!("Cluster event listener stopped");
                            return;
                        }
                    }
                }
            };
            if degraded {
                info!(channel = EVENT_CHANNEL, "Cluster event listener reconnected");
                degraded = false;
            } else {
                info!(channel = EVENT_CHANNEL, "Cluster event listener started");
            }

            loop {
                let notification = tokio::select! {
                    result = listener.try_recv() => result,
                    () = shutdown.cancelled() => {
                        info!("Cluster event listener stopped");
                        return;
                    }
                };
                match notification {
                    Ok(Some(message)) => {
                        if degraded {
                            info!("Cluster event listener reconnected");
                            degraded = false;
                        }
                        self.dispatch(message.payload());
                    }
                    // Connection lost; the next try_recv reconnects and
                    // resubscribes on its own.
                    Ok(None) => {
                        if !degraded {
                            warn!("Cluster event listener lost its connection; reconnecting");
                            degraded = true;
                        }
                    }
                    Err(e) => {
                        if !degraded {
                            warn!(error = %e, "Cluster event listener error; retrying");
                            degraded = true;
                        }
                        tokio::select! {
                            () = tokio::time::sleep(LISTEN_RETRY_INTERVAL) => {}
                            () = shutdown.cancelled() => {
                                info!("Cluster event listener stopped");
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    fn dispatch(&self, payload: &str) {
        match serde_json::from_str::<StreamingEvent>(payload) {
            Ok(event) => {
                debug!(?event, "Received cluster event");
                // No receivers is normal on worker-only nodes.
                let _ = self.local_tx.send(event);
            }
            Err(e) => {
                warn!(error = %e, "Failed to parse cluster event envelope");
            }
        }
    }
}

async fn connect_and_listen(pool: &sqlx::PgPool) -> Result<PgListener, sqlx::Error> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(EVENT_CHANNEL).await?;
    Ok(listener)
}

fn interaction(actor_id: &str, target_id: &str) -> UserInteraction {
    UserInteraction {
        actor_id: actor_id.to_string(),
        target_id: target_id.to_string(),
    }
}

fn filter(id: &str, user_id: &str) -> FilterPayload {
    FilterPayload {
        id: id.to_string(),
        user_id: user_id.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_subscriber_count_tracks_receivers() {
        let bus = EventBus::new(Arc::new(DatabaseConnection::default()));
        assert_eq!(bus.local_subscriber_count(), 0);

        let rx = bus.subscribe();
        let rx2 = bus.subscribe();
        assert_eq!(bus.local_subscriber_count(), 2);

        drop(rx);
        drop(rx2);
        assert_eq!(bus.local_subscriber_count(), 0);
    }

    #[test]
    fn test_note_event_serialization() {
        let event = StreamingEvent::NotePublished(NotePayload {
            id: "note1".to_string(),
            user_id: "user1".to_string(),
            text: Some("Hello".to_string()),
            visibility: "public".to_string(),
        });

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"notePublished\""));
        assert!(json.contains("\"id\":\"note1\""));

        let parsed: StreamingEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, StreamingEvent::NotePublished(_)));
    }

    #[test]
    fn test_interaction_event_serialization() {
        let event = StreamingEvent::UserFollowed(UserInteraction {
            actor_id: "user1".to_string(),
            target_id: "user2".to_string(),
        });

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"userFollowed\""));
        assert!(json.contains("\"actor_id\":\"user1\""));
        assert!(json.contains("\"target_id\":\"user2\""));
    }

    #[test]
    fn test_reaction_omitted_for_plain_likes() {
        let event = StreamingEvent::NoteLiked(NoteInteraction {
            note_id: "note1".to_string(),
            user_id: "user1".to_string(),
            reaction: None,
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("reaction"));

        let event = StreamingEvent::NoteReacted(NoteInteraction {
            note_id: "note1".to_string(),
            user_id: "user1".to_string(),
            reaction: Some("🎉".to_string()),
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"reaction\":\"🎉\""));
    }

    #[test]
    fn test_unknown_fields_are_tolerated() {
        // A newer node may add fields; older nodes must still parse the
        // envelope during a rolling upgrade.
        let json = r#"{"type":"noteDeleted","id":"note1","user_id":"user1",
                       "text":null,"visibility":"public","added_later":true}"#;
        let parsed: StreamingEvent = serde_json::from_str(json).unwrap();
        assert!(matches!(parsed, StreamingEvent::NoteDeleted(_)));
    }

    #[test]
    fn test_notification_event_round_trip() {
        let event = StreamingEvent::NotificationCreated(NotificationPayload {
            id: "notif1".to_string(),
            user_id: "user1".to_string(),
            notification_type: "follow".to_string(),
            source_user_id: Some("user2".to_string()),
            note_id: None,
        });

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"notificationCreated\""));
        let parsed: StreamingEvent = serde_json::from_str(&json).unwrap();
        match parsed {
            StreamingEvent::NotificationCreated(p) => {
                assert_eq!(p.notification_type, "follow");
                assert_eq!(p.source_user_id.as_deref(), Some("user2"));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
