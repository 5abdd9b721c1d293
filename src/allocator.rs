//! Room/batch allocation: one fresh room per spawn tick.

use crate::error::{AgentError, ErrorKind};
use crate::metrics::{MetricEvent, Metrics};
use crate::sut::{AuthSession, ChatApi, NewRoom, RoomId};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const ROOM_LIST_PAGE_SIZE: u32 = 10;

/// A room the run sends agents into. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    pub id: RoomId,
    pub sequence: u64,
    pub creator: String,
}

/// A room and the number of agents that should join it this tick.
#[derive(Debug, Clone)]
pub struct RoomBatch {
    pub room: Arc<Room>,
    pub agent_count: usize,
}

/// Creates rooms under the privileged account.
pub struct RoomAllocator {
    api: Arc<dyn ChatApi>,
    admin: AuthSession,
    fixed_room: Option<RoomId>,
    metrics: Arc<Metrics>,
}

impl RoomAllocator {
    pub fn new(
        api: Arc<dyn ChatApi>,
        admin: AuthSession,
        fixed_room: Option<RoomId>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            api,
            admin,
            fixed_room,
            metrics,
        }
    }

    /// Provide a room for batch `sequence`.
    ///
    /// With a fixed room configured no request is made. Otherwise the room
    /// list is read (informational only) and a new room is created; a
    /// creation failure is charged to the room error counter and returned so
    /// the tick spawns nobody.
    pub async fn allocate_batch(
        &self,
        sequence: u64,
        agent_count: usize,
    ) -> Result<RoomBatch, AgentError> {
        if let Some(id) = &self.fixed_room {
            return Ok(RoomBatch {
                room: Arc::new(Room {
                    id: id.clone(),
                    sequence,
                    creator: self.admin.user_name.clone(),
                }),
                agent_count,
            });
        }

        match self.api.list_rooms(&self.admin, 0, ROOM_LIST_PAGE_SIZE).await {
            Ok(listing) => debug!("Room list: {} rooms in system", listing.total),
            Err(e) => warn!("Failed to fetch room list: {}", e),
        }

        let request = NewRoom {
            name: format!("Ramp-Up Test Room #{}", sequence),
            description: format!(
                "Load test room {} - {}",
                sequence,
                chrono::Utc::now().to_rfc3339()
            ),
        };

        match self.api.create_room(&self.admin, &request).await {
            Ok(id) => {
                self.metrics.record(MetricEvent::RoomCreated);
                info!("Room #{} created: {}", sequence, id);
                Ok(RoomBatch {
                    room: Arc::new(Room {
                        id,
                        sequence,
                        creator: self.admin.user_name.clone(),
                    }),
                    agent_count,
                })
            }
            Err(e) => {
                self.metrics.record(MetricEvent::Error(ErrorKind::Room));
                error!("Failed to create room #{}: {}", sequence, e);
                Err(AgentError::Room(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sut::{login_or_register, Credentials, LoopbackChatServer};

    async fn allocator(
        server: &Arc<LoopbackChatServer>,
        fixed_room: Option<RoomId>,
    ) -> (RoomAllocator, Arc<Metrics>) {
        let admin = login_or_register(server.as_ref(), &Credentials::for_user("admin"))
            .await
            .unwrap();
        let metrics = Arc::new(Metrics::new().unwrap());
        let allocator = RoomAllocator::new(server.clone(), admin, fixed_room, metrics.clone());
        (allocator, metrics)
    }

    #[tokio::test]
    async fn test_creates_one_room_per_batch() {
        let server = LoopbackChatServer::new();
        let (allocator, metrics) = allocator(&server, None).await;

        let first = allocator.allocate_batch(1, 3).await.unwrap();
        let second = allocator.allocate_batch(2, 4).await.unwrap();

        assert_ne!(first.room.id, second.room.id);
        assert_eq!(first.room.sequence, 1);
        assert_eq!(second.agent_count, 4);
        assert_eq!(first.room.creator, "RampUp User admin");
        assert_eq!(server.room_count(), 2);
        assert_eq!(metrics.counters().rooms_created, 2);
    }

    #[tokio::test]
    async fn test_creation_failure_is_a_room_error() {
        let server = LoopbackChatServer::new();
        let (allocator, metrics) = allocator(&server, None).await;
        server.set_room_creation_failing(true);

        let err = allocator.allocate_batch(1, 3).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Room);
        assert!(!err.feeds_backpressure());

        let counters = metrics.counters();
        assert_eq!(counters.errors_room, 1);
        assert_eq!(counters.rooms_created, 0);
    }

    #[tokio::test]
    async fn test_fixed_room_skips_creation() {
        let server = LoopbackChatServer::new();
        let fixed = RoomId::from("lobby");
        let (allocator, metrics) = allocator(&server, Some(fixed.clone())).await;

        for sequence in 1..=3 {
            let batch = allocator.allocate_batch(sequence, 2).await.unwrap();
            assert_eq!(batch.room.id, fixed);
        }
        assert_eq!(server.room_count(), 0);
        assert_eq!(metrics.counters().rooms_created, 0);
    }
}
