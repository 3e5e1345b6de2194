//! Bot-side `requestLogin` handler.

use std::sync::Arc;

use async_trait::async_trait;
use botlink_core::{PendingLogin, PendingLoginStore, UserDirectory, now_millis};
use botlink_transport::{HandlerError, RequestHandler};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::code::{login_code, login_nonce};

/// Request type served by [`LoginOrchestrator`].
pub const REQUEST_LOGIN: &str = "requestLogin";

/// Attempts at drawing a code not already active for the user.
const MAX_CODE_ATTEMPTS: usize = 32;

#[derive(Debug, Deserialize)]
struct LoginRequest {
    user: String,
}

/// Source of candidate login codes.
pub type CodeSource = Box<dyn Fn() -> String + Send + Sync>;

/// Issues pending logins for the API.
pub struct LoginOrchestrator<U, S> {
    users: Arc<U>,
    store: Arc<S>,
    codes: CodeSource,
}

impl<U, S> LoginOrchestrator<U, S>
where
    U: UserDirectory,
    S: PendingLoginStore,
{
    /// Create an orchestrator over a user directory and pending login store.
    #[must_use]
    pub fn new(users: Arc<U>, store: Arc<S>) -> Self {
        Self {
            users,
            store,
            codes: Box::new(login_code),
        }
    }

    /// Draw candidate codes from `codes` instead of the random generator.
    #[must_use]
    pub fn with_code_source(mut self, codes: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.codes = Box::new(codes);
        self
    }

    /// Issue a pending login for `user` at `now`.
    ///
    /// # Errors
    /// `404` when the user does not resolve; a status-less failure when
    /// storage fails or no free code is found.
    pub async fn issue(&self, user: &str, now: i64) -> Result<PendingLogin, HandlerError> {
        let Some(canonical) = self.users.resolve(user).await? else {
            tracing::info!(user, "Login requested for unknown user");
            return Err(HandlerError::with_status(404, "user not found"));
        };

        let require_phishing_confirmation = self.store.count_confirmed(&canonical).await? == 0;
        let nonce = login_nonce();
        for _ in 0..MAX_CODE_ATTEMPTS {
            let login = PendingLogin::issue(
                canonical.as_str(),
                (self.codes)(),
                nonce.as_str(),
                require_phishing_confirmation,
                now,
            );
            if self.store.create(&login, now).await? {
                tracing::info!(user = %login.user, code = %login.code, "Login attempt");
                return Ok(login);
            }
            tracing::debug!(user = %login.user, "Login code already active, drawing another");
        }

        tracing::error!(user = %canonical, "No free login code after {MAX_CODE_ATTEMPTS} attempts");
        Err(HandlerError::new("could not allocate a login code"))
    }
}

#[async_trait]
impl<U, S> RequestHandler for LoginOrchestrator<U, S>
where
    U: UserDirectory + 'static,
    S: PendingLoginStore + 'static,
{
    async fn handle(&self, data: Value) -> Result<Value, HandlerError> {
        let request: LoginRequest = serde_json::from_value(data)
            .map_err(|e| HandlerError::with_status(400, format!("invalid request: {e}")))?;
        let login = self.issue(&request.user, now_millis()).await?;
        Ok(json!({
            "success": true,
            "uid": login.user,
            "nonce": login.nonce,
            "code": login.code,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        code::is_login_code,
        storage::{MemoryStore, StaticUserDirectory},
    };

    fn orchestrator() -> (LoginOrchestrator<StaticUserDirectory, MemoryStore>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let users = Arc::new(StaticUserDirectory::new(["ALICE", "BOB"]));
        (LoginOrchestrator::new(users, Arc::clone(&store)), store)
    }

    #[tokio::test]
    async fn test_request_login_reply() {
        let (orchestrator, store) = orchestrator();
        let reply = orchestrator.handle(json!({ "user": "alice" })).await.unwrap();

        assert_eq!(reply["success"], true);
        assert_eq!(reply["uid"], "ALICE");
        let code = reply["code"].as_str().unwrap();
        assert!(is_login_code(code));
        let nonce = reply["nonce"].as_str().unwrap();

        let row = store
            .find_for_exchange("ALICE", nonce, code, now_millis())
            .await
            .unwrap()
            .unwrap();
        assert!(!row.confirmed);
        assert!(row.require_phishing_confirmation);
    }

    #[tokio::test]
    async fn test_unknown_user_is_404() {
        let (orchestrator, _) = orchestrator();
        let err = orchestrator.handle(json!({ "user": "mallory" })).await.unwrap_err();
        assert_eq!(err, HandlerError::with_status(404, "user not found"));
        assert_eq!(
            err.into_reply(),
            json!({ "success": false, "statusCode": 404, "error": "user not found" })
        );
    }

    #[tokio::test]
    async fn test_malformed_request_is_400() {
        let (orchestrator, _) = orchestrator();
        let err = orchestrator.handle(json!({ "name": "alice" })).await.unwrap_err();
        assert_eq!(err.status, Some(400));
    }

    #[tokio::test]
    async fn test_phishing_confirmation_only_before_first_confirmed_login() {
        let (orchestrator, store) = orchestrator();

        let first = orchestrator.issue("alice", 0).await.unwrap();
        let second = orchestrator.issue("alice", 0).await.unwrap();
        assert!(first.require_phishing_confirmation);
        assert!(second.require_phishing_confirmation);

        assert!(store.confirm(first.id).await.unwrap());
        let third = orchestrator.issue("alice", 0).await.unwrap();
        assert!(!third.require_phishing_confirmation);

        let other = orchestrator.issue("bob", 0).await.unwrap();
        assert!(other.require_phishing_confirmation);
    }

    #[tokio::test]
    async fn test_taken_code_is_redrawn() {
        let (orchestrator, store) = orchestrator();
        let draws = Arc::new(AtomicUsize::new(0));
        let orchestrator = orchestrator.with_code_source({
            let draws = Arc::clone(&draws);
            move || {
                let n = draws.fetch_add(1, Ordering::SeqCst);
                let code = if n == 0 { "0000000A" } else { "0000000B" };
                code.to_string()
            }
        });
        let held = PendingLogin::issue("ALICE", "0000000A", "n0", true, 0);
        assert!(store.create(&held, 0).await.unwrap());

        let login = orchestrator.issue("alice", 0).await.unwrap();
        assert_eq!(login.code, "0000000B");
        assert_eq!(draws.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gives_up_when_every_code_is_taken() {
        let (orchestrator, _) = orchestrator();
        let orchestrator = orchestrator.with_code_source(|| "0000000A".to_string());

        orchestrator.issue("alice", 0).await.unwrap();
        let err = orchestrator.issue("alice", 0).await.unwrap_err();
        assert_eq!(err, HandlerError::new("could not allocate a login code"));

        // The pair is only taken per user.
        assert!(orchestrator.issue("bob", 0).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_requests_never_share_a_code() {
        let (orchestrator, store) = orchestrator();
        let orchestrator = Arc::new(orchestrator.with_code_source(|| "0000000C".to_string()));

        let requests: Vec<_> = (0..8)
            .map(|_| {
                let orchestrator = Arc::clone(&orchestrator);
                tokio::spawn(async move { orchestrator.issue("alice", 0).await })
            })
            .collect();
        let mut issued = 0;
        for request in requests {
            if request.await.unwrap().is_ok() {
                issued += 1;
            }
        }
        assert_eq!(issued, 1);
        assert!(store.has_active("ALICE", "0000000C", 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_active_codes_are_unique_per_user() {
        let (orchestrator, store) = orchestrator();
        let mut codes = std::collections::HashSet::new();
        for _ in 0..50 {
            let login = orchestrator.issue("alice", 0).await.unwrap();
            assert!(codes.insert(login.code.clone()));
            assert!(store.has_active("ALICE", &login.code, 0).await.unwrap());
        }
    }
}
