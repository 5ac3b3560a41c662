//! Transport independent entry point for distribution decisions
use super::error::{DistributionError, ErrorKind};
use super::service::{Decision, DecisionRequest, DistributionService};
use super::types::Role;
use tracing::error;

/// The authenticated identity making a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub role: Role,
}

/// Decision body as received from a client; every field may be missing.
#[derive(Debug, Default, Clone)]
pub struct DistributePayload {
    pub donation_id: Option<String>,
    pub orphanage_name: Option<String>,
    pub action: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub status: u16,
    pub message: String,
}

impl<T> Envelope<T> {
    pub fn ok(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            status: 200,
            message: message.into(),
        }
    }

    pub fn failure(err: &DistributionError) -> Self {
        let kind = err.kind();
        // internal details stay in the logs
        let error = match kind {
            ErrorKind::Internal => "Server error".to_string(),
            _ => err.to_string(),
        };
        Self {
            success: false,
            data: None,
            error: Some(error),
            status: kind.status_code(),
            message: String::new(),
        }
    }
}

/// Decide on a donation on behalf of the NGO addressed by `ngo_id`.
pub fn distribute(
    service: &DistributionService,
    caller: &Caller,
    ngo_id: &str,
    payload: &DistributePayload,
) -> Envelope<Decision> {
    match try_distribute(service, caller, ngo_id, payload) {
        Ok(decision) => {
            let message = match decision {
                Decision::Accepted { .. } => "Donation accepted and distributed",
                Decision::Rejected { .. } => "Donation rejected",
            };
            Envelope::ok(decision, message)
        }
        Err(err) => {
            if err.kind() == ErrorKind::Internal {
                error!(error = %err, ngo_id, "distribution failed");
            }
            Envelope::failure(&err)
        }
    }
}

fn try_distribute(
    service: &DistributionService,
    caller: &Caller,
    ngo_id: &str,
    payload: &DistributePayload,
) -> Result<Decision, DistributionError> {
    if caller.role != Role::Ngo {
        return Err(DistributionError::Forbidden(
            "Unauthorized - insufficient role".into(),
        ));
    }
    if caller.user_id != ngo_id {
        return Err(DistributionError::Forbidden("Forbidden".into()));
    }

    let request = DecisionRequest::parse(
        payload.donation_id.as_deref(),
        payload.orphanage_name.as_deref(),
        payload.action.as_deref(),
    )?;
    service.decide(ngo_id, &request)
}
