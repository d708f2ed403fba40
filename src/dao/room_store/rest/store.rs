use std::{sync::Arc, time::Duration, time::SystemTime};

use futures::{
    future::BoxFuture,
    stream::{self, StreamExt},
};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use uuid::Uuid;

use crate::dao::{
    models::{
        BanEntity, ParticipantEntity, ParticipantStatus, ProfileEntity, RoomEntity, RoomPatch,
        epoch_millis,
    },
    room_store::{ChangeFeed, ChangeStream, ChannelStatus, FeedMessage, RoomStore},
    storage::StorageResult,
};

use super::{
    config::RestConfig,
    error::{RestDaoError, RestResult},
};

const REST_PREFIX: &str = "rest/v1";
const PREFER_REPRESENTATION: &str = "return=representation";
const PREFER_UPSERT: &str = "resolution=merge-duplicates,return=representation";

/// Row store speaking the PostgREST dialect over HTTP.
#[derive(Clone)]
pub struct RestRoomStore {
    client: Client,
    base_url: Arc<str>,
    api_key: Arc<str>,
    access_token: Option<Arc<str>>,
}

/// Body used to upsert a participant on its `(room_id, user_id)` key.
#[derive(Serialize)]
struct ParticipantUpsert {
    room_id: Uuid,
    user_id: Uuid,
    status: ParticipantStatus,
    #[serde(with = "epoch_millis")]
    last_seen_at: SystemTime,
}

#[derive(Deserialize)]
struct CleanupResult {
    removed: u64,
}

impl RestRoomStore {
    /// Build the HTTP client and verify the backend answers.
    pub async fn connect(config: RestConfig) -> RestResult<Self> {
        let store = Self::from_config(config)?;
        store.ping().await?;
        Ok(store)
    }

    fn from_config(config: RestConfig) -> RestResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|source| RestDaoError::ClientBuilder { source })?;

        Ok(Self {
            client,
            base_url: Arc::from(config.base_url.trim_end_matches('/')),
            api_key: Arc::from(config.api_key),
            access_token: config.access_token.map(Arc::from),
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}/{}", self.base_url, REST_PREFIX, path);
        let bearer = self.access_token.as_deref().unwrap_or(self.api_key.as_ref());
        self.client
            .request(method, url)
            .header("apikey", self.api_key.as_ref())
            .bearer_auth(bearer)
    }

    async fn ping(&self) -> RestResult<()> {
        let path = String::new();
        let response = self
            .request(Method::GET, &path)
            .send()
            .await
            .map_err(|source| RestDaoError::RequestSend {
                path: path.clone(),
                source,
            })?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(RestDaoError::RequestStatus {
                path,
                status: response.status(),
            })
        }
    }

    async fn execute<T>(&self, path: String, builder: reqwest::RequestBuilder) -> RestResult<T>
    where
        T: DeserializeOwned,
    {
        let response = builder
            .send()
            .await
            .map_err(|source| RestDaoError::RequestSend {
                path: path.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RestDaoError::RequestStatus { path, status });
        }

        response
            .json::<T>()
            .await
            .map_err(|source| RestDaoError::DecodeResponse { path, source })
    }

    async fn select<T>(&self, path: String) -> RestResult<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let builder = self.request(Method::GET, &path);
        self.execute(path, builder).await
    }

    async fn select_one<T>(&self, path: String) -> RestResult<Option<T>>
    where
        T: DeserializeOwned,
    {
        Ok(self.select(path).await?.into_iter().next())
    }

    async fn write<T, B>(
        &self,
        method: Method,
        path: String,
        body: Option<&B>,
        prefer: &str,
    ) -> RestResult<Vec<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let mut builder = self.request(method, &path).header("Prefer", prefer);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        self.execute(path, builder).await
    }

    async fn rpc<T, B>(&self, name: &str, body: &B) -> RestResult<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let path = format!("rpc/{name}");
        let builder = self.request(Method::POST, &path).json(body);
        self.execute(path, builder).await
    }

    async fn rpc_unit<B>(&self, name: &str, body: &B) -> RestResult<()>
    where
        B: Serialize + ?Sized,
    {
        let path = format!("rpc/{name}");
        let response = self
            .request(Method::POST, &path)
            .json(body)
            .send()
            .await
            .map_err(|source| RestDaoError::RequestSend {
                path: path.clone(),
                source,
            })?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(RestDaoError::RequestStatus {
                path,
                status: response.status(),
            })
        }
    }
}

fn first_row<T>(path: &str, rows: Vec<T>) -> RestResult<T> {
    rows.into_iter()
        .next()
        .ok_or_else(|| RestDaoError::EmptyRepresentation {
            path: path.to_string(),
        })
}

impl RoomStore for RestRoomStore {
    fn fetch_room(&self, room_id: Uuid) -> BoxFuture<'static, StorageResult<Option<RoomEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            Ok(store
                .select_one(format!("rooms?id=eq.{room_id}&select=*"))
                .await?)
        })
    }

    fn find_room_by_code(
        &self,
        code: String,
    ) -> BoxFuture<'static, StorageResult<Option<RoomEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let code = code.to_uppercase();
            Ok(store
                .select_one(format!("rooms?code=eq.{code}&select=*"))
                .await?)
        })
    }

    fn insert_room(&self, room: RoomEntity) -> BoxFuture<'static, StorageResult<RoomEntity>> {
        let store = self.clone();
        Box::pin(async move {
            let path = "rooms".to_string();
            let rows = store
                .write(Method::POST, path.clone(), Some(&room), PREFER_REPRESENTATION)
                .await?;
            Ok(first_row(&path, rows)?)
        })
    }

    fn update_room(
        &self,
        room_id: Uuid,
        patch: RoomPatch,
    ) -> BoxFuture<'static, StorageResult<Option<RoomEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let mut patch = patch;
            patch.updated_at.get_or_insert_with(SystemTime::now);
            let rows: Vec<RoomEntity> = store
                .write(
                    Method::PATCH,
                    format!("rooms?id=eq.{room_id}"),
                    Some(&patch),
                    PREFER_REPRESENTATION,
                )
                .await?;
            Ok(rows.into_iter().next())
        })
    }

    fn list_participants(
        &self,
        room_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<ParticipantEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            Ok(store
                .select(format!(
                    "participants?room_id=eq.{room_id}&order=created_at.asc,id.asc"
                ))
                .await?)
        })
    }

    fn find_participant(
        &self,
        room_id: Uuid,
        user_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<ParticipantEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            Ok(store
                .select_one(format!(
                    "participants?room_id=eq.{room_id}&user_id=eq.{user_id}"
                ))
                .await?)
        })
    }

    fn list_memberships(
        &self,
        user_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<ParticipantEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            Ok(store
                .select(format!("participants?user_id=eq.{user_id}"))
                .await?)
        })
    }

    fn upsert_participant(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        status: ParticipantStatus,
    ) -> BoxFuture<'static, StorageResult<ParticipantEntity>> {
        let store = self.clone();
        Box::pin(async move {
            let path = "participants?on_conflict=room_id,user_id".to_string();
            let body = ParticipantUpsert {
                room_id,
                user_id,
                status,
                last_seen_at: SystemTime::now(),
            };
            let rows = store
                .write(Method::POST, path.clone(), Some(&body), PREFER_UPSERT)
                .await?;
            Ok(first_row(&path, rows)?)
        })
    }

    fn update_participant_status(
        &self,
        participant_id: Uuid,
        status: ParticipantStatus,
    ) -> BoxFuture<'static, StorageResult<Option<ParticipantEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let rows: Vec<ParticipantEntity> = store
                .write(
                    Method::PATCH,
                    format!("participants?id=eq.{participant_id}"),
                    Some(&json!({ "status": status })),
                    PREFER_REPRESENTATION,
                )
                .await?;
            Ok(rows.into_iter().next())
        })
    }

    fn delete_participant(&self, participant_id: Uuid) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move {
            let rows: Vec<ParticipantEntity> = store
                .write::<_, ()>(
                    Method::DELETE,
                    format!("participants?id=eq.{participant_id}"),
                    None,
                    PREFER_REPRESENTATION,
                )
                .await?;
            Ok(!rows.is_empty())
        })
    }

    fn find_ban(
        &self,
        room_id: Uuid,
        user_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<BanEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            Ok(store
                .select_one(format!("bans?room_id=eq.{room_id}&user_id=eq.{user_id}"))
                .await?)
        })
    }

    fn increment_ban(
        &self,
        room_id: Uuid,
        user_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<BanEntity>> {
        let store = self.clone();
        Box::pin(async move {
            Ok(store
                .rpc(
                    "increment_ban",
                    &json!({ "room_id": room_id, "user_id": user_id }),
                )
                .await?)
        })
    }

    fn fetch_profile(
        &self,
        user_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<ProfileEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            Ok(store
                .select_one(format!("profiles?user_id=eq.{user_id}"))
                .await?)
        })
    }

    fn claim_session(&self, user_id: Uuid, marker: String) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            let _rows: Vec<ProfileEntity> = store
                .write(
                    Method::PATCH,
                    format!("profiles?user_id=eq.{user_id}"),
                    Some(&json!({ "active_session": marker })),
                    PREFER_REPRESENTATION,
                )
                .await?;
            Ok(())
        })
    }

    fn touch_participant(
        &self,
        room_id: Uuid,
        _user_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            Ok(store
                .rpc_unit("touch_participant", &json!({ "room_id": room_id }))
                .await?)
        })
    }

    fn cleanup_stale_participants(
        &self,
        room_id: Uuid,
        threshold: Duration,
    ) -> BoxFuture<'static, StorageResult<u64>> {
        let store = self.clone();
        Box::pin(async move {
            let result: CleanupResult = store
                .rpc(
                    "cleanup_stale_participants",
                    &json!({ "room_id": room_id, "threshold_seconds": threshold.as_secs() }),
                )
                .await?;
            Ok(result.removed)
        })
    }
}

/// Change feed for the REST backend: reports an errored channel and never
/// delivers changes, which keeps subscribers on the aggressive poll.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestChangeFeed;

impl ChangeFeed for RestChangeFeed {
    fn subscribe(&self, _room_id: Uuid) -> BoxFuture<'static, StorageResult<ChangeStream>> {
        Box::pin(async move {
            let stream = stream::once(async { FeedMessage::Status(ChannelStatus::Error) })
                .chain(stream::pending());
            Ok(stream.boxed())
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        task::JoinHandle,
    };

    use super::*;
    use crate::dao::{
        models::{RoomStatus, WinningPatterns},
        storage::StorageError,
    };

    const ROOM_ID: &str = "00000000-0000-0000-0000-00000000000a";
    const PARTICIPANT_ROWS: &str = r#"[{
        "id": "00000000-0000-0000-0000-000000000001",
        "room_id": "00000000-0000-0000-0000-00000000000a",
        "user_id": "00000000-0000-0000-0000-000000000002",
        "status": "pending",
        "profile_ref": null,
        "last_seen_at": 1700000000123,
        "created_at": "2024-01-01T00:00:00Z"
    }]"#;

    /// One-shot HTTP server answering a single request with a canned response.
    struct Stub {
        base_url: String,
        request: JoinHandle<String>,
    }

    async fn stub(status: &'static str, body: &'static str) -> Stub {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}/", listener.local_addr().unwrap());
        let request = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let raw = read_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            raw
        });
        Stub { base_url, request }
    }

    /// Read the head and the announced body, lowercased for matching.
    async fn read_request(socket: &mut TcpStream) -> String {
        let mut raw = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let read = socket.read(&mut chunk).await.unwrap();
            if read == 0 {
                break;
            }
            raw.extend_from_slice(&chunk[..read]);
            let text = String::from_utf8_lossy(&raw).into_owned();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if raw.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&raw).to_lowercase()
    }

    fn store(base_url: &str) -> RestRoomStore {
        let client = Client::builder().no_proxy().build().unwrap();
        RestRoomStore {
            client,
            ..RestRoomStore::from_config(RestConfig::new(base_url, "anon-key")).unwrap()
        }
    }

    fn room() -> RoomEntity {
        RoomEntity {
            id: Uuid::new_v4(),
            code: "ABC234".into(),
            name: "rest".into(),
            host_id: Uuid::new_v4(),
            status: RoomStatus::Lobby,
            drawn_numbers: vec![],
            updated_at: SystemTime::UNIX_EPOCH,
            player_limit: 4,
            current_round: 1,
            rounds: 1,
            prize_pool: 0,
            winning_patterns: WinningPatterns::default(),
            draw_interval_seconds: 10,
        }
    }

    #[test]
    fn requests_carry_the_prefix_and_credentials() {
        let anonymous = store("http://db.test/");
        let request = anonymous
            .request(Method::GET, "rooms?code=eq.ABC234")
            .build()
            .unwrap();
        assert_eq!(
            request.url().as_str(),
            "http://db.test/rest/v1/rooms?code=eq.ABC234"
        );
        assert_eq!(request.headers()["apikey"], "anon-key");
        assert_eq!(request.headers()[reqwest::header::AUTHORIZATION], "Bearer anon-key");

        let user = crate::dao::models::AuthUser {
            id: Uuid::new_v4(),
            email: "host@example.com".into(),
        };
        let signed_in = RestRoomStore::from_config(
            RestConfig::new("http://db.test", "anon-key").with_session("user-token", user),
        )
        .unwrap();
        let request = signed_in.request(Method::GET, "rooms").build().unwrap();
        assert_eq!(request.url().as_str(), "http://db.test/rest/v1/rooms");
        assert_eq!(request.headers()[reqwest::header::AUTHORIZATION], "Bearer user-token");
    }

    #[test]
    fn upsert_body_stamps_epoch_millis() {
        let body = ParticipantUpsert {
            room_id: Uuid::nil(),
            user_id: Uuid::nil(),
            status: ParticipantStatus::Pending,
            last_seen_at: SystemTime::UNIX_EPOCH + Duration::from_millis(1_500),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["last_seen_at"], 1_500);
        assert_eq!(value["status"], "pending");
    }

    #[tokio::test]
    async fn participants_are_listed_in_arrival_order() {
        let server = stub("200 OK", PARTICIPANT_ROWS).await;
        let room_id = Uuid::parse_str(ROOM_ID).unwrap();

        let rows = store(&server.base_url).list_participants(room_id).await.unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, ParticipantStatus::Pending);
        assert_eq!(
            rows[0].last_seen_at,
            SystemTime::UNIX_EPOCH + Duration::from_millis(1_700_000_000_123)
        );
        let request = server.request.await.unwrap();
        assert!(request.starts_with(&format!(
            "get /rest/v1/participants?room_id=eq.{ROOM_ID}&order=created_at.asc,id.asc "
        )));
        assert!(request.contains("apikey: anon-key"));
    }

    #[tokio::test]
    async fn upsert_asks_for_a_merge_on_the_room_and_user_key() {
        let server = stub("201 Created", PARTICIPANT_ROWS).await;

        let row = store(&server.base_url)
            .upsert_participant(Uuid::new_v4(), Uuid::new_v4(), ParticipantStatus::Pending)
            .await
            .unwrap();

        assert_eq!(row.status, ParticipantStatus::Pending);
        let request = server.request.await.unwrap();
        assert!(request.starts_with("post /rest/v1/participants?on_conflict=room_id,user_id "));
        assert!(request.contains("prefer: resolution=merge-duplicates,return=representation"));
        assert!(request.contains("\"last_seen_at\":"));
    }

    #[tokio::test]
    async fn conflicting_insert_maps_to_a_storage_conflict() {
        let server = stub("409 Conflict", "").await;

        let err = store(&server.base_url).insert_room(room()).await.unwrap_err();

        assert!(matches!(err, StorageError::Conflict { .. }));
    }

    #[tokio::test]
    async fn empty_selections_read_as_missing_rows() {
        let server = stub("200 OK", "[]").await;
        assert!(store(&server.base_url).fetch_room(Uuid::new_v4()).await.unwrap().is_none());

        let server = stub("200 OK", "[]").await;
        assert!(!store(&server.base_url).delete_participant(Uuid::new_v4()).await.unwrap());
        assert!(server.request.await.unwrap().starts_with("delete /rest/v1/participants?id=eq."));
    }

    #[tokio::test]
    async fn unreachable_backend_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let err = store(&base_url).fetch_room(Uuid::new_v4()).await.unwrap_err();

        assert!(matches!(err, StorageError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn feed_reports_an_errored_channel() {
        let mut feed = RestChangeFeed.subscribe(Uuid::new_v4()).await.unwrap();
        assert!(matches!(
            feed.next().await,
            Some(FeedMessage::Status(ChannelStatus::Error))
        ));
    }
}
