//! Service layer API for the donation distribution workflow
use super::donation::{Donation, DonationDraft};
use super::error::{DistributionError, ValidationError};
use super::history::{HistoryEntry, HistoryTx};
use super::matching::{RequestMatcher, SameKind};
use super::request::{OrphanageRequest, RequestDraft, RequestTx};
use super::store::{Store, decode, encode, or_abort};
use super::types::Role;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError, Transactional,
    TransactionalTree,
};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

// Rescans allowed when new requests keep arriving for the pair during an accept.
const MAX_ACCEPT_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionAction {
    Accept,
    Reject,
}

impl FromStr for DecisionAction {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accept" => Ok(DecisionAction::Accept),
            "reject" => Ok(DecisionAction::Reject),
            other => Err(ValidationError::UnknownAction(other.to_string())),
        }
    }
}

/// An NGO's ruling on one donation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionRequest {
    pub donation_id: String,
    pub orphanage_name: Option<String>, // required to accept, ignored on reject
    pub action: DecisionAction,
}

impl DecisionRequest {
    pub fn accept(donation_id: impl Into<String>, orphanage_name: impl Into<String>) -> Self {
        Self {
            donation_id: donation_id.into(),
            orphanage_name: Some(orphanage_name.into()),
            action: DecisionAction::Accept,
        }
    }
    pub fn reject(donation_id: impl Into<String>) -> Self {
        Self {
            donation_id: donation_id.into(),
            orphanage_name: None,
            action: DecisionAction::Reject,
        }
    }

    /// Parse raw caller fields. The action is checked first, then the ids it needs.
    pub fn parse(
        donation_id: Option<&str>,
        orphanage_name: Option<&str>,
        action: Option<&str>,
    ) -> Result<Self, ValidationError> {
        let action: DecisionAction = action
            .ok_or(ValidationError::MissingField("action"))?
            .parse()?;
        let request = Self {
            donation_id: donation_id.unwrap_or_default().to_string(),
            orphanage_name: orphanage_name.map(str::to_string),
            action,
        };
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.donation_id.is_empty() {
            return Err(ValidationError::MissingField("donationId"));
        }
        if self.action == DecisionAction::Accept
            && self.orphanage_name.as_deref().is_none_or(str::is_empty)
        {
            return Err(ValidationError::MissingField("orphanageName"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accepted {
        donation: Donation,
        distribution: HistoryEntry,
    },
    Rejected {
        donation_id: String,
    },
}

// Updated donation and number of requests removed; None when the scan went stale.
type AcceptOutcome = Option<(Donation, usize)>;

// Points inside the accept transaction, used to interrupt it in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptStep {
    DonationUpdated,
    HistoryAppended,
    RequestsRemoved,
}

pub struct DistributionService {
    store: Arc<Store>,
    matcher: Box<dyn RequestMatcher>,
    #[cfg(test)]
    interrupt: Option<AcceptStep>,
    #[cfg(test)]
    after_scan: Option<fn(&DistributionService, usize, &str, &str)>,
}

impl DistributionService {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            matcher: Box::new(SameKind),
            #[cfg(test)]
            interrupt: None,
            #[cfg(test)]
            after_scan: None,
        }
    }

    /// Replace the policy choosing which requests an accepted donation fulfils.
    pub fn with_matcher(mut self, matcher: impl RequestMatcher + 'static) -> Self {
        self.matcher = Box::new(matcher);
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Record a donor's pledge to an NGO. The donation always starts PENDING.
    #[instrument(skip(self, draft), fields(donor_id = %acting_donor_id))]
    pub fn pledge(
        &self,
        acting_donor_id: &str,
        draft: DonationDraft,
    ) -> Result<Donation, DistributionError> {
        let donation = draft.validate_and_finalise()?;
        if donation.donor_id != acting_donor_id {
            return Err(DistributionError::Forbidden(
                "Cannot create donation for other user".into(),
            ));
        }
        let directory = self.store.directory();
        directory.require(&donation.donor_id, Role::Donor)?;
        directory.require(&donation.ngo_id, Role::Ngo)?;

        self.store.donations().insert(&donation)?;

        info!(
            donation_id = %donation.id,
            ngo_id = %donation.ngo_id,
            kind = ?donation.kind(),
            "donation pledged"
        );
        Ok(donation)
    }

    /// Record an orphanage's ask to an NGO.
    #[instrument(skip(self, draft), fields(orphanage_id = %acting_orphanage_id))]
    pub fn request(
        &self,
        acting_orphanage_id: &str,
        draft: RequestDraft,
    ) -> Result<OrphanageRequest, DistributionError> {
        let request = draft.validate_and_finalise()?;
        if request.orphanage_id != acting_orphanage_id {
            return Err(DistributionError::Forbidden(
                "Cannot create request for other user".into(),
            ));
        }
        let directory = self.store.directory();
        directory.require(&request.orphanage_id, Role::Orphanage)?;
        directory.require(&request.ngo_id, Role::Ngo)?;

        self.store.requests().insert(&request)?;

        info!(
            request_id = %request.id,
            ngo_id = %request.ngo_id,
            kind = ?request.kind(),
            "request created"
        );
        Ok(request)
    }

    /// Apply an NGO's accept or reject decision to a pending donation.
    ///
    /// Either every effect of the decision is committed or none is: on any error the
    /// donation, the requests and the history are left untouched.
    #[instrument(
        skip(self, request),
        fields(donation_id = %request.donation_id, action = ?request.action)
    )]
    pub fn decide(
        &self,
        acting_ngo_id: &str,
        request: &DecisionRequest,
    ) -> Result<Decision, DistributionError> {
        request.validate()?;

        let donation = self
            .store
            .donations()
            .get(&request.donation_id)?
            .ok_or_else(|| DistributionError::NotFound("Donation not found".into()))?;

        if donation.ngo_id != acting_ngo_id {
            warn!(owner = %donation.ngo_id, "decision on a donation owned by another NGO");
            return Err(DistributionError::Forbidden(
                "Donation does not belong to this NGO".into(),
            ));
        }
        if !donation.is_pending() {
            return Err(already_distributed(&donation.id));
        }

        match (request.action, request.orphanage_name.as_deref()) {
            (DecisionAction::Reject, _) => self.reject(acting_ngo_id, &donation),
            (DecisionAction::Accept, Some(orphanage_name)) => {
                self.accept(acting_ngo_id, &donation, orphanage_name)
            }
            (DecisionAction::Accept, None) => {
                Err(ValidationError::MissingField("orphanageName").into())
            }
        }
    }

    fn reject(&self, ngo_id: &str, donation: &Donation) -> Result<Decision, DistributionError> {
        let history = self.store.history();
        let staged = history.stage(HistoryEntry::rejected(
            &donation.id,
            ngo_id,
            &donation.donor_id,
        )?)?;

        let result: Result<(), TransactionError<DistributionError>> = (
            self.store.donations().tree(),
            &history.entries,
            &history.by_donation,
            &history.by_orphanage,
        )
            .transaction(|(donations, entries, by_donation, by_orphanage)| {
                pending_in(donations, &donation.id)?;
                HistoryTx {
                    entries,
                    by_donation,
                    by_orphanage,
                }
                .append(&staged)
            });
        result?;

        info!(history_id = %staged.entry.id, "donation rejected");
        Ok(Decision::Rejected {
            donation_id: donation.id.clone(),
        })
    }

    fn accept(
        &self,
        ngo_id: &str,
        donation: &Donation,
        orphanage_name: &str,
    ) -> Result<Decision, DistributionError> {
        let orphanage = self
            .store
            .directory()
            .find_by_name(Role::Orphanage, orphanage_name)?
            .ok_or_else(|| {
                DistributionError::NotFound("Orphanage not found by that name".into())
            })?;

        let history = self.store.history();
        let staged = history.stage(HistoryEntry::accepted(
            &donation.id,
            ngo_id,
            &orphanage.id,
            &donation.donor_id,
        )?)?;
        let requests = self.store.requests();

        for attempt in 0..MAX_ACCEPT_ATTEMPTS {
            let generation = requests.generation(&orphanage.id, ngo_id)?;
            let fulfilled: Vec<String> = requests
                .pending_between(&orphanage.id, ngo_id)?
                .into_iter()
                .filter(|r| self.matcher.matches(donation, r))
                .map(|r| r.id)
                .collect();
            self.scanned(attempt, &orphanage.id, ngo_id);

            let result: Result<AcceptOutcome, TransactionError<DistributionError>> = (
                self.store.donations().tree(),
                &requests.requests,
                &requests.by_pair,
                &requests.by_ngo,
                &requests.by_orphanage,
                &requests.generations,
                &history.entries,
                &history.by_donation,
                &history.by_orphanage,
            )
                .transaction(
                    |(
                        donations,
                        requests,
                        requests_by_pair,
                        requests_by_ngo,
                        requests_by_orphanage,
                        request_generations,
                        entries,
                        history_by_donation,
                        history_by_orphanage,
                    )| {
                        let current = pending_in(donations, &donation.id)?;
                        let ledger = RequestTx {
                            requests,
                            by_pair: requests_by_pair,
                            by_ngo: requests_by_ngo,
                            by_orphanage: requests_by_orphanage,
                            generations: request_generations,
                        };
                        // a request filed since the scan is not in `fulfilled`
                        if ledger.generation(&orphanage.id, ngo_id)? != generation {
                            return Ok(None);
                        }

                        let updated = current.distributed_to(orphanage_name);
                        donations.insert(updated.id.as_bytes(), or_abort(encode(&updated))?)?;
                        self.checkpoint(AcceptStep::DonationUpdated)?;

                        HistoryTx {
                            entries,
                            by_donation: history_by_donation,
                            by_orphanage: history_by_orphanage,
                        }
                        .append(&staged)?;
                        self.checkpoint(AcceptStep::HistoryAppended)?;

                        let mut removed = 0;
                        for id in &fulfilled {
                            if ledger.remove_pending(id)? {
                                removed += 1;
                            }
                        }
                        self.checkpoint(AcceptStep::RequestsRemoved)?;

                        Ok(Some((updated, removed)))
                    },
                );
            let Some((updated, removed)) = result? else {
                debug!(attempt, orphanage_id = %orphanage.id, "requests changed during accept");
                continue;
            };

            info!(
                history_id = %staged.entry.id,
                orphanage_id = %orphanage.id,
                requests_fulfilled = removed,
                "donation accepted and distributed"
            );
            return Ok(Decision::Accepted {
                donation: updated,
                distribution: staged.entry,
            });
        }

        warn!(orphanage_id = %orphanage.id, "gave up accepting after repeated request changes");
        Err(DistributionError::Conflict(
            "Requests for this orphanage keep changing, try again".into(),
        ))
    }

    #[cfg(test)]
    fn checkpoint(
        &self,
        step: AcceptStep,
    ) -> ConflictableTransactionResult<(), DistributionError> {
        if self.interrupt == Some(step) {
            return Err(ConflictableTransactionError::Abort(DistributionError::Internal(
                format!("interrupted after {step:?}"),
            )));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn checkpoint(
        &self,
        _step: AcceptStep,
    ) -> ConflictableTransactionResult<(), DistributionError> {
        Ok(())
    }

    #[cfg(test)]
    fn scanned(&self, attempt: usize, orphanage_id: &str, ngo_id: &str) {
        if let Some(hook) = self.after_scan {
            hook(self, attempt, orphanage_id, ngo_id);
        }
    }

    #[cfg(not(test))]
    fn scanned(&self, _attempt: usize, _orphanage_id: &str, _ngo_id: &str) {}
}

/// Read the donation inside a transaction, aborting unless it is still pending.
fn pending_in(
    donations: &TransactionalTree,
    donation_id: &str,
) -> ConflictableTransactionResult<Donation, DistributionError> {
    let Some(bytes) = donations.get(donation_id.as_bytes())? else {
        return Err(ConflictableTransactionError::Abort(DistributionError::NotFound(
            "Donation not found".into(),
        )));
    };
    let donation: Donation = or_abort(decode(&bytes))?;
    if !donation.is_pending() {
        return Err(ConflictableTransactionError::Abort(already_distributed(
            donation_id,
        )));
    }
    Ok(donation)
}

fn already_distributed(donation_id: &str) -> DistributionError {
    DistributionError::Conflict(format!("Donation {donation_id} has already been distributed"))
}
