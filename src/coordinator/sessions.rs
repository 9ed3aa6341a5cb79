use tracing::{debug, info, warn};

use super::{Coordinator, CoordinatorError};
use crate::models::{WorkerSession, now_secs};
use crate::protocol::{ConnectResponse, RecentlyActiveWorkers, Request, Response};

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn display_name(session: &WorkerSession) -> String {
    let name = session.nickname.as_deref().unwrap_or(&session.id);
    match &session.task_slot {
        Some(slot) => format!("{}#{}", name, slot),
        None => name.to_string(),
    }
}

impl Coordinator {
    /// Resume a known session or mint a new one.
    ///
    /// Lookup: nickname + task slot, else nickname alone, else worker id.
    pub(super) async fn connect(&self, request: &Request) -> Result<Response, CoordinatorError> {
        let nickname = non_blank(request.nickname.as_deref());
        let task_slot = non_blank(request.task_slot.as_deref());

        let existing = match (nickname, task_slot) {
            (Some(nickname), Some(slot)) => self.store.find_session_by_slot(nickname, slot).await?,
            (Some(nickname), None) => self.store.find_session_by_nickname(nickname).await?,
            (None, _) => match non_blank(request.worker_id.as_deref()) {
                Some(id) => self.store.get_session(id).await?,
                None => None,
            },
        };

        if let Some(mut session) = existing {
            session.last_active_at = now_secs();
            self.store.save_session(&session).await?;
            info!(worker = %display_name(&session), "worker reconnected");
            let message = format!("welcome back {}", display_name(&session));
            return Ok(Response::ok(&ConnectResponse { worker_id: session.id })?.with_message(message));
        }

        let session = WorkerSession::new(nickname.map(str::to_string), task_slot.map(str::to_string));
        self.store.save_session(&session).await?;
        info!(worker = %display_name(&session), id = %session.id, "new worker connected");
        let message = format!("new worker {} connected", display_name(&session));
        Ok(Response::ok(&ConnectResponse { worker_id: session.id })?.with_message(message))
    }

    /// Refresh `lastActiveAt`. Unknown ids and store failures are logged only.
    pub(super) async fn touch_session(&self, worker_id: &str) {
        let result = async {
            if let Some(mut session) = self.store.get_session(worker_id).await? {
                session.last_active_at = now_secs();
                self.store.save_session(&session).await?;
            } else {
                debug!(worker_id, "request from unknown worker id");
            }
            Ok::<_, CoordinatorError>(())
        }
        .await;
        if let Err(e) = result {
            warn!(worker_id, error = %e, "failed to refresh worker session");
        }
    }

    pub(super) async fn recently_active_workers(&self) -> Result<RecentlyActiveWorkers, CoordinatorError> {
        let since = now_secs().saturating_sub(crate::config::Config::ACTIVE_WORKER_WINDOW_SECS);
        let workers = self.store.sessions_active_since(since).await?;
        Ok(RecentlyActiveWorkers { workers })
    }
}
