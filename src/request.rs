//! Orphanage requests addressed to NGOs
use super::error::{DistributionError, ValidationError};
use super::store::{decode, encode, new_id, or_abort};
use super::types::{Kind, Payload, TimeStamp};
use super::utils::{REQUEST_HRP, compound_key, key_prefix};
use chrono::Utc;
use sled::transaction::{
    ConflictableTransactionResult, TransactionError, Transactional, TransactionalTree,
};
use tracing::{debug, instrument};

const REQUESTS: &str = "requests";
const REQUESTS_BY_PAIR: &str = "requests_by_pair";
const REQUESTS_BY_NGO: &str = "requests_by_ngo";
const REQUESTS_BY_ORPHANAGE: &str = "requests_by_orphanage";
const REQUEST_GENERATIONS: &str = "request_generations";

// A request is fulfilled by removing it, so pending is the only stored state.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum RequestStatus {
    #[n(0)]
    Pending,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Eq, PartialEq)]
pub struct OrphanageRequest {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub orphanage_id: String,
    #[n(2)]
    pub ngo_id: String,
    #[n(3)]
    pub payload: Payload,
    #[n(4)]
    pub status: RequestStatus,
    #[n(5)]
    pub created_at: TimeStamp<Utc>,
}

impl OrphanageRequest {
    pub fn kind(&self) -> Kind {
        self.payload.kind()
    }

    fn pair_key(&self) -> Vec<u8> {
        compound_key(&[
            self.orphanage_id.as_bytes(),
            self.ngo_id.as_bytes(),
            self.id.as_bytes(),
        ])
    }
    fn ngo_key(&self) -> Vec<u8> {
        compound_key(&[self.ngo_id.as_bytes(), self.id.as_bytes()])
    }
    fn orphanage_key(&self) -> Vec<u8> {
        compound_key(&[self.orphanage_id.as_bytes(), self.id.as_bytes()])
    }
}

fn generation_key(orphanage_id: &str, ngo_id: &str) -> Vec<u8> {
    compound_key(&[orphanage_id.as_bytes(), ngo_id.as_bytes()])
}

fn read_generation(value: Option<&[u8]>) -> Result<u64, DistributionError> {
    let Some(bytes) = value else {
        return Ok(0);
    };
    let bytes: [u8; 8] = bytes.try_into().map_err(|_| {
        DistributionError::Internal("request generation is not a u64".to_string())
    })?;
    Ok(u64::from_be_bytes(bytes))
}

#[derive(Debug, Default, Clone)]
pub struct RequestDraft {
    orphanage_id: Option<String>,
    ngo_id: Option<String>,
    payload: Option<Payload>,
}

impl RequestDraft {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_orphanage(mut self, orphanage_id: impl Into<String>) -> Self {
        self.orphanage_id = Some(orphanage_id.into());
        self
    }
    pub fn set_ngo(mut self, ngo_id: impl Into<String>) -> Self {
        self.ngo_id = Some(ngo_id.into());
        self
    }
    pub fn set_money(mut self, amount: u64) -> Self {
        self.payload = Some(Payload::money(amount));
        self
    }
    pub fn set_item(mut self, item_name: impl Into<String>, count: u32) -> Self {
        self.payload = Some(Payload::item(item_name, count));
        self
    }

    pub fn validate_and_finalise(&self) -> Result<OrphanageRequest, DistributionError> {
        let orphanage_id = non_empty(&self.orphanage_id, "orphanageId")?;
        let ngo_id = non_empty(&self.ngo_id, "ngoId")?;
        let payload = self
            .payload
            .clone()
            .ok_or(ValidationError::MissingField("type"))?;
        payload.validate()?;

        Ok(OrphanageRequest {
            id: new_id(REQUEST_HRP)?,
            orphanage_id,
            ngo_id,
            payload,
            status: RequestStatus::Pending,
            created_at: TimeStamp::new(),
        })
    }
}

fn non_empty(value: &Option<String>, field: &'static str) -> Result<String, ValidationError> {
    match value.as_deref() {
        Some(v) if v.contains('\0') => Err(ValidationError::ReservedCharacter(field)),
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(ValidationError::MissingField(field)),
    }
}

pub struct RequestLedger {
    pub(crate) requests: sled::Tree,
    // orphanage id \0 ngo id \0 request id
    pub(crate) by_pair: sled::Tree,
    // ngo id \0 request id
    pub(crate) by_ngo: sled::Tree,
    // orphanage id \0 request id
    pub(crate) by_orphanage: sled::Tree,
    // orphanage id \0 ngo id -> u64, bumped by every insert for the pair
    pub(crate) generations: sled::Tree,
}

impl RequestLedger {
    pub(crate) fn open(db: &sled::Db) -> sled::Result<Self> {
        Ok(Self {
            requests: db.open_tree(REQUESTS)?,
            by_pair: db.open_tree(REQUESTS_BY_PAIR)?,
            by_ngo: db.open_tree(REQUESTS_BY_NGO)?,
            by_orphanage: db.open_tree(REQUESTS_BY_ORPHANAGE)?,
            generations: db.open_tree(REQUEST_GENERATIONS)?,
        })
    }

    #[instrument(skip(self, request), fields(request_id = %request.id, ngo_id = %request.ngo_id))]
    pub(crate) fn insert(&self, request: &OrphanageRequest) -> Result<(), DistributionError> {
        let record = encode(request)?;
        let (pair_key, ngo_key, orphanage_key) =
            (request.pair_key(), request.ngo_key(), request.orphanage_key());
        let generation_key = generation_key(&request.orphanage_id, &request.ngo_id);

        let result: Result<(), TransactionError<DistributionError>> = (
            &self.requests,
            &self.by_pair,
            &self.by_ngo,
            &self.by_orphanage,
            &self.generations,
        )
            .transaction(|(requests, by_pair, by_ngo, by_orphanage, generations)| {
                requests.insert(request.id.as_bytes(), record.as_slice())?;
                by_pair.insert(pair_key.as_slice(), &[] as &[u8])?;
                by_ngo.insert(ngo_key.as_slice(), &[] as &[u8])?;
                by_orphanage.insert(orphanage_key.as_slice(), &[] as &[u8])?;

                let current = generations.get(generation_key.as_slice())?;
                let next = or_abort(read_generation(current.as_deref()))? + 1;
                generations.insert(generation_key.as_slice(), &next.to_be_bytes()[..])?;
                Ok(())
            });
        result?;

        debug!("request stored");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<OrphanageRequest>, DistributionError> {
        self.requests
            .get(id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Number of requests ever inserted for the pair. A changed value means new requests
    /// may have arrived since a previous `pending_between` scan.
    pub(crate) fn generation(
        &self,
        orphanage_id: &str,
        ngo_id: &str,
    ) -> Result<u64, DistributionError> {
        let current = self.generations.get(generation_key(orphanage_id, ngo_id))?;
        read_generation(current.as_deref())
    }

    /// Pending requests one orphanage has addressed to one NGO.
    pub fn pending_between(
        &self,
        orphanage_id: &str,
        ngo_id: &str,
    ) -> Result<Vec<OrphanageRequest>, DistributionError> {
        let requests = self.collect(&self.by_pair, &[orphanage_id.as_bytes(), ngo_id.as_bytes()])?;
        Ok(requests
            .into_iter()
            .filter(|r| r.status == RequestStatus::Pending)
            .collect())
    }

    /// Requests addressed to an NGO, newest first.
    pub fn for_ngo(&self, ngo_id: &str) -> Result<Vec<OrphanageRequest>, DistributionError> {
        self.collect(&self.by_ngo, &[ngo_id.as_bytes()])
    }

    /// Requests made by an orphanage, newest first.
    pub fn for_orphanage(
        &self,
        orphanage_id: &str,
    ) -> Result<Vec<OrphanageRequest>, DistributionError> {
        self.collect(&self.by_orphanage, &[orphanage_id.as_bytes()])
    }

    fn collect(
        &self,
        index: &sled::Tree,
        segments: &[&[u8]],
    ) -> Result<Vec<OrphanageRequest>, DistributionError> {
        let prefix = key_prefix(segments);
        let mut requests = vec![];
        for entry in index.scan_prefix(&prefix) {
            let (key, _) = entry?;
            let id = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            if let Some(request) = self.get(&id)? {
                requests.push(request);
            }
        }
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(requests)
    }
}

/// Request trees as seen from inside a decision transaction.
pub(crate) struct RequestTx<'a> {
    pub requests: &'a TransactionalTree,
    pub by_pair: &'a TransactionalTree,
    pub by_ngo: &'a TransactionalTree,
    pub by_orphanage: &'a TransactionalTree,
    pub generations: &'a TransactionalTree,
}

impl RequestTx<'_> {
    pub fn generation(
        &self,
        orphanage_id: &str,
        ngo_id: &str,
    ) -> ConflictableTransactionResult<u64, DistributionError> {
        let current = self.generations.get(generation_key(orphanage_id, ngo_id))?;
        or_abort(read_generation(current.as_deref()))
    }

    /// Removes the request and its index rows if it is still pending. Returns whether a
    /// row was removed; a request already gone is not an error.
    pub fn remove_pending(
        &self,
        id: &str,
    ) -> ConflictableTransactionResult<bool, DistributionError> {
        let Some(bytes) = self.requests.get(id.as_bytes())? else {
            return Ok(false);
        };
        let request: OrphanageRequest = or_abort(decode(&bytes))?;
        if request.status != RequestStatus::Pending {
            return Ok(false);
        }

        self.requests.remove(id.as_bytes())?;
        self.by_pair.remove(request.pair_key())?;
        self.by_ngo.remove(request.ngo_key())?;
        self.by_orphanage.remove(request.orphanage_key())?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> RequestLedger {
        let db = sled::Config::new().temporary(true).open().unwrap();
        RequestLedger::open(&db).unwrap()
    }

    fn stored(ledger: &RequestLedger, orphanage: &str, ngo: &str) -> OrphanageRequest {
        let request = RequestDraft::new()
            .set_orphanage(orphanage)
            .set_ngo(ngo)
            .set_money(50)
            .validate_and_finalise()
            .unwrap();
        ledger.insert(&request).unwrap();
        request
    }

    #[test]
    fn listings_are_newest_first() {
        let ledger = ledger();
        let asked_at = |day| {
            let mut request = RequestDraft::new()
                .set_orphanage("home_a")
                .set_ngo("ngo_a")
                .set_item("rice", 3)
                .validate_and_finalise()
                .unwrap();
            request.created_at = TimeStamp::new_with(2024, 5, day, 12, 0, 0).unwrap();
            request
        };
        let older = asked_at(2);
        let newer = asked_at(9);
        ledger.insert(&older).unwrap();
        ledger.insert(&newer).unwrap();

        assert_eq!(ledger.for_ngo("ngo_a").unwrap(), vec![newer.clone(), older.clone()]);
        assert_eq!(ledger.for_orphanage("home_a").unwrap(), vec![newer, older]);
    }

    #[test]
    fn pending_between_is_scoped_to_the_pair() {
        let ledger = ledger();
        let wanted = stored(&ledger, "home_a", "ngo_a");
        stored(&ledger, "home_a", "ngo_b");
        stored(&ledger, "home_b", "ngo_a");

        let pending = ledger.pending_between("home_a", "ngo_a").unwrap();
        assert_eq!(pending, vec![wanted]);
    }

    #[test]
    fn removal_clears_every_index() {
        let ledger = ledger();
        let request = stored(&ledger, "home_a", "ngo_a");

        let removed: Result<bool, TransactionError<DistributionError>> = (
            &ledger.requests,
            &ledger.by_pair,
            &ledger.by_ngo,
            &ledger.by_orphanage,
            &ledger.generations,
        )
            .transaction(|(requests, by_pair, by_ngo, by_orphanage, generations)| {
                RequestTx {
                    requests,
                    by_pair,
                    by_ngo,
                    by_orphanage,
                    generations,
                }
                .remove_pending(&request.id)
            });

        assert!(removed.unwrap());
        assert!(ledger.get(&request.id).unwrap().is_none());
        assert!(ledger.for_ngo("ngo_a").unwrap().is_empty());
        assert!(ledger.for_orphanage("home_a").unwrap().is_empty());
        assert!(ledger.pending_between("home_a", "ngo_a").unwrap().is_empty());
    }

    #[test]
    fn inserts_bump_the_pair_generation() {
        let ledger = ledger();
        assert_eq!(ledger.generation("home_a", "ngo_a").unwrap(), 0);

        stored(&ledger, "home_a", "ngo_a");
        stored(&ledger, "home_a", "ngo_a");
        stored(&ledger, "home_a", "ngo_b");

        assert_eq!(ledger.generation("home_a", "ngo_a").unwrap(), 2);
        assert_eq!(ledger.generation("home_a", "ngo_b").unwrap(), 1);
        assert_eq!(ledger.generation("home_b", "ngo_a").unwrap(), 0);
    }

    #[test]
    fn drafts_reject_invalid_payloads() {
        let err = RequestDraft::new()
            .set_orphanage("home_a")
            .set_ngo("ngo_a")
            .set_item("", 2)
            .validate_and_finalise()
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }
}
