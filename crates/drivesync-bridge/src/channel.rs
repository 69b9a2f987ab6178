//! Request/response surface for the application shell.
//!
//! Requests arrive as a method name plus JSON arguments; token bytes travel as standard
//! base64 strings. Failures carry one of the wire codes below.
//!
//! | Method | Arguments | Result |
//! |---|---|---|
//! | `createBookmark` | `{"url": str, "readOnly"?: bool}` | base64 token |
//! | `pickDirectory` | `{"readOnly"?: bool}` | `{"path": str, "bookmark": base64}` |
//! | `startAccess` | `{"bookmark": base64}` | resolved path |
//! | `stopAccess` | `{"bookmark"?: base64}` | `null` |

use crate::broker::{
    AccessMode, AccessSession, Bookmark, BrokerError, FolderPicker, ScopedAccessBroker,
    TokenDigest,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

pub const CODE_BAD_ARGS: &str = "bad_args";
pub const CODE_BOOKMARK_FAILED: &str = "bookmark_failed";
pub const CODE_BUSY: &str = "busy";
pub const CODE_CANCELLED: &str = "cancelled";
pub const CODE_NO_SELECTION: &str = "no_selection";
pub const CODE_ACCESS_DENIED: &str = "access_denied";
pub const CODE_RESOLVE_FAILED: &str = "resolve_failed";
pub const CODE_NOT_IMPLEMENTED: &str = "not_implemented";

/// A failed request as seen by the shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelError {
    pub code: &'static str,
    pub message: String,
}

impl ChannelError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ChannelError {}

impl From<BrokerError> for ChannelError {
    fn from(e: BrokerError) -> Self {
        let code = match &e {
            BrokerError::InvalidPath(_) | BrokerError::InvalidToken(_) => CODE_BAD_ARGS,
            BrokerError::BookmarkFailed { .. } => CODE_BOOKMARK_FAILED,
            BrokerError::Unreadable(_) => CODE_RESOLVE_FAILED,
            BrokerError::AccessDenied { .. } => CODE_ACCESS_DENIED,
            BrokerError::Busy => CODE_BUSY,
            BrokerError::NoSelection => CODE_NO_SELECTION,
            BrokerError::Cancelled => CODE_CANCELLED,
        };
        Self::new(code, e.to_string())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBookmarkArgs {
    url: String,
    #[serde(default)]
    read_only: bool,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PickArgs {
    #[serde(default)]
    read_only: bool,
}

#[derive(Deserialize)]
struct BookmarkArgs {
    bookmark: String,
}

#[derive(Deserialize, Default)]
struct StopArgs {
    #[serde(default)]
    bookmark: Option<String>,
}

fn parse<T: DeserializeOwned>(args: Value, what: &str) -> Result<T, ChannelError> {
    serde_json::from_value(args)
        .map_err(|e| ChannelError::new(CODE_BAD_ARGS, format!("{what}: {e}")))
}

fn mode(read_only: bool) -> AccessMode {
    if read_only {
        AccessMode::ReadOnly
    } else {
        AccessMode::ReadWrite
    }
}

/// Bookmark method channel.
pub struct BookmarkChannel {
    broker: Arc<ScopedAccessBroker>,
    picker: Arc<dyn FolderPicker>,
    /// Sessions opened by `startAccess`, oldest first.
    sessions: Mutex<Vec<(TokenDigest, AccessSession)>>,
}

impl BookmarkChannel {
    pub fn new(broker: Arc<ScopedAccessBroker>, picker: Arc<dyn FolderPicker>) -> Self {
        Self {
            broker,
            picker,
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// Dispatch one request.
    pub async fn handle(&self, method: &str, args: Value) -> Result<Value, ChannelError> {
        debug!("channel: {}", method);
        let result = match method {
            "createBookmark" => {
                let args: CreateBookmarkArgs = parse(args, "missing url")?;
                self.create_bookmark(&args.url, mode(args.read_only))
                    .map(|b| Value::String(b.to_base64()))
            }
            "pickDirectory" => {
                let args: PickArgs = if args.is_null() {
                    PickArgs::default()
                } else {
                    parse(args, "bad pick arguments")?
                };
                self.pick_directory(mode(args.read_only)).await
            }
            "startAccess" => {
                let args: BookmarkArgs = parse(args, "missing bookmark")?;
                let bookmark = Bookmark::from_base64(&args.bookmark)?;
                self.start_access(&bookmark).map(Value::String)
            }
            "stopAccess" => {
                let args: StopArgs = if args.is_null() {
                    StopArgs::default()
                } else {
                    parse(args, "bad stop arguments")?
                };
                let bookmark = args
                    .bookmark
                    .as_deref()
                    .map(Bookmark::from_base64)
                    .transpose()?;
                self.stop_access(bookmark.as_ref());
                Ok(Value::Null)
            }
            other => Err(ChannelError::new(
                CODE_NOT_IMPLEMENTED,
                format!("unknown method {other}"),
            )),
        };
        if let Err(e) = &result {
            warn!("channel: {} failed: {}", method, e);
        }
        result
    }

    pub fn create_bookmark(&self, location: &str, mode: AccessMode) -> Result<Bookmark, ChannelError> {
        Ok(self.broker.mint(location, mode)?)
    }

    pub async fn pick_directory(&self, mode: AccessMode) -> Result<Value, ChannelError> {
        let picked = self
            .broker
            .pick_directory(self.picker.as_ref(), mode)
            .await?;
        Ok(json!({
            "path": picked.path.to_string_lossy(),
            "bookmark": picked.bookmark.to_base64(),
        }))
    }

    /// Activate a token and keep its session until `stopAccess`.
    pub fn start_access(&self, bookmark: &Bookmark) -> Result<String, ChannelError> {
        let (session, resolved) = self.broker.activate(bookmark)?;
        let path = resolved.path.to_string_lossy().into_owned();
        self.sessions.lock().push((bookmark.digest(), session));
        Ok(path)
    }

    /// Release the newest session for `bookmark`, or the newest session overall.
    /// Returns whether a session was released.
    pub fn stop_access(&self, bookmark: Option<&Bookmark>) -> bool {
        let session = {
            let mut sessions = self.sessions.lock();
            let idx = match bookmark {
                Some(b) => {
                    let digest = b.digest();
                    sessions.iter().rposition(|(d, _)| *d == digest)
                }
                None => sessions.len().checked_sub(1),
            };
            idx.map(|i| sessions.remove(i).1)
        };
        match session {
            Some(session) => {
                self.broker.deactivate(session);
                true
            }
            None => false,
        }
    }

    /// Dismiss a pending `pickDirectory`.
    pub fn dismiss_picker(&self) -> bool {
        self.broker.dismiss_picker()
    }

    /// Number of sessions held for the shell.
    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().len()
    }
}
