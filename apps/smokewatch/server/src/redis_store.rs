use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use smokewatch_core::{AlertEvent, CameraId, CameraIdentity, CameraRecord};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

use crate::error::CollaboratorError;
use crate::store::{ensure_token_owner, CameraStore, DetectionStore, SeedError};

const COLLABORATOR: &str = "redis";

fn camera_key(camera_id: CameraId) -> String {
    format!("camera:{camera_id}")
}

fn token_key(token: &str) -> String {
    format!("camera:token:{token}")
}

fn online_key(camera_id: CameraId) -> String {
    format!("camera:{camera_id}:online")
}

fn last_seen_key(camera_id: CameraId) -> String {
    format!("camera:{camera_id}:last_seen")
}

fn camera_detections_key(camera_id: CameraId) -> String {
    format!("camera:{camera_id}:detections")
}

fn redis_error(err: redis::RedisError) -> CollaboratorError {
    CollaboratorError::unavailable(COLLABORATOR, err)
}

fn timestamp(at: OffsetDateTime) -> Result<String, CollaboratorError> {
    at.format(&Rfc3339)
        .map_err(|err| CollaboratorError::invalid_response(COLLABORATOR, err))
}

/// Camera registry and detection log kept in Redis.
///
/// Layout:
/// - `camera:<id>` JSON camera record
/// - `camera:token:<token>` camera id owning the token
/// - `camera:<id>:online` / `camera:<id>:last_seen` liveness
/// - `detection:seq`, `detection:<id>` and `camera:<id>:detections` for alerts
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis })
    }

    /// Writes a camera record and its token index, dropping the index of a rotated token.
    ///
    /// The token index is claimed with `SET NX` before anything else is written, so a token
    /// already held by another camera fails with [`SeedError::DuplicateToken`].
    pub async fn register_camera(&self, record: &CameraRecord) -> Result<(), SeedError> {
        let mut conn = self.redis.clone();
        let payload = serde_json::to_string(record)
            .map_err(|err| CollaboratorError::invalid_response(COLLABORATOR, err))?;

        let claimed: Option<String> = redis::cmd("SET")
            .arg(token_key(&record.api_key))
            .arg(record.id.0)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        if claimed.is_none() {
            let owner: Option<i64> = conn
                .get(token_key(&record.api_key))
                .await
                .map_err(redis_error)?;
            ensure_token_owner(owner.map(CameraId), record)?;
        }

        if let Some(previous) = conn
            .get::<_, Option<String>>(camera_key(record.id))
            .await
            .map_err(redis_error)?
            .and_then(|raw| serde_json::from_str::<CameraRecord>(&raw).ok())
        {
            if previous.api_key != record.api_key {
                conn.del::<_, ()>(token_key(&previous.api_key))
                    .await
                    .map_err(redis_error)?;
            }
        }

        redis::pipe()
            .cmd("SET")
            .arg(camera_key(record.id))
            .arg(payload)
            .ignore()
            .cmd("SET")
            .arg(token_key(&record.api_key))
            .arg(record.id.0)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(())
    }
}

#[async_trait]
impl CameraStore for RedisStore {
    async fn resolve_token(
        &self,
        token: &str,
    ) -> Result<Option<CameraIdentity>, CollaboratorError> {
        let mut conn = self.redis.clone();
        let camera_id: Option<i64> = conn.get(token_key(token)).await.map_err(redis_error)?;
        let Some(camera_id) = camera_id else {
            return Ok(None);
        };
        let record = self.camera(CameraId(camera_id)).await?;
        Ok(record
            .filter(|record| record.active && record.api_key == token)
            .map(|record| record.identity()))
    }

    async fn camera(&self, camera_id: CameraId) -> Result<Option<CameraRecord>, CollaboratorError> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(camera_key(camera_id)).await.map_err(redis_error)?;
        raw.map(|raw| {
            serde_json::from_str(&raw)
                .map_err(|err| CollaboratorError::invalid_response(COLLABORATOR, err))
        })
        .transpose()
    }

    async fn set_online(
        &self,
        camera_id: CameraId,
        online: bool,
        at: OffsetDateTime,
    ) -> Result<(), CollaboratorError> {
        let mut conn = self.redis.clone();
        redis::pipe()
            .cmd("SET")
            .arg(online_key(camera_id))
            .arg(if online { "1" } else { "0" })
            .ignore()
            .cmd("SET")
            .arg(last_seen_key(camera_id))
            .arg(timestamp(at)?)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(redis_error)?;
        debug!(camera_id = %camera_id, online, "camera liveness written");
        Ok(())
    }

    async fn touch(
        &self,
        camera_id: CameraId,
        at: OffsetDateTime,
    ) -> Result<(), CollaboratorError> {
        let mut conn = self.redis.clone();
        redis::pipe()
            .cmd("SET")
            .arg(online_key(camera_id))
            .arg("1")
            .ignore()
            .cmd("SET")
            .arg(last_seen_key(camera_id))
            .arg(timestamp(at)?)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(redis_error)
    }
}

#[async_trait]
impl DetectionStore for RedisStore {
    async fn save(&self, event: &AlertEvent) -> Result<String, CollaboratorError> {
        let mut conn = self.redis.clone();
        let payload = serde_json::to_string(event)
            .map_err(|err| CollaboratorError::invalid_response(COLLABORATOR, err))?;
        let id: i64 = conn.incr("detection:seq", 1).await.map_err(redis_error)?;
        redis::pipe()
            .cmd("SET")
            .arg(format!("detection:{id}"))
            .arg(payload)
            .ignore()
            .cmd("RPUSH")
            .arg(camera_detections_key(event.camera_id()))
            .arg(id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(id.to_string())
    }
}
