//! Append-only audit trail of distribution decisions
//!
//! Every decision writes exactly one [`HistoryEntry`]. Entries are never updated or removed;
//! the index rows pointing at an entry carry a sha256 digest of its encoding, which is checked
//! again whenever the entry is read back.
use super::error::DistributionError;
use super::store::{decode, encode, new_id};
use super::types::TimeStamp;
use super::utils::{HISTORY_HRP, compound_key, key_prefix};
use chrono::Utc;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionalTree,
};
use tracing::error;

const HISTORY: &str = "history";
const HISTORY_BY_DONATION: &str = "history_by_donation";
const HISTORY_BY_ORPHANAGE: &str = "history_by_orphanage";

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum HistoryAction {
    #[n(0)]
    Accepted,
    #[n(1)]
    Rejected,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Eq, PartialEq)]
pub struct HistoryEntry {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub donation_id: String,
    #[n(2)]
    pub ngo_id: String,
    #[n(3)]
    pub orphanage_id: Option<String>, // None for rejections
    #[n(4)]
    pub donor_id: String,
    #[n(5)]
    pub action: HistoryAction,
    #[n(6)]
    pub distributed_at: TimeStamp<Utc>,
}

// value of an index row
#[derive(minicbor::Encode, minicbor::Decode, Debug)]
struct EntryRef {
    #[n(0)]
    entry_id: String,
    #[n(1)]
    digest: String,
}

impl HistoryEntry {
    pub fn accepted(
        donation_id: &str,
        ngo_id: &str,
        orphanage_id: &str,
        donor_id: &str,
    ) -> Result<Self, DistributionError> {
        Self::new(donation_id, ngo_id, Some(orphanage_id), donor_id, HistoryAction::Accepted)
    }

    pub fn rejected(
        donation_id: &str,
        ngo_id: &str,
        donor_id: &str,
    ) -> Result<Self, DistributionError> {
        Self::new(donation_id, ngo_id, None, donor_id, HistoryAction::Rejected)
    }

    fn new(
        donation_id: &str,
        ngo_id: &str,
        orphanage_id: Option<&str>,
        donor_id: &str,
        action: HistoryAction,
    ) -> Result<Self, DistributionError> {
        Ok(Self {
            id: new_id(HISTORY_HRP)?,
            donation_id: donation_id.to_string(),
            ngo_id: ngo_id.to_string(),
            orphanage_id: orphanage_id.map(str::to_string),
            donor_id: donor_id.to_string(),
            action,
            distributed_at: TimeStamp::new(),
        })
    }

    /// Encoded entry and the sha256 digest of that encoding.
    pub fn build(&self) -> Result<(String, Vec<u8>), DistributionError> {
        let cbor = encode(self)?;
        let hash = sha256::digest(&cbor);

        Ok((hash, cbor))
    }
}

/// An entry encoded and keyed ahead of a transaction. Transactions may be retried, so all
/// of this is computed once outside the closure.
pub(crate) struct StagedEntry {
    pub entry: HistoryEntry,
    record: Vec<u8>,
    donation_key: Vec<u8>,
    orphanage_key: Option<Vec<u8>>,
    entry_ref: Vec<u8>,
}

pub struct DistributionHistory {
    db: sled::Db,
    pub(crate) entries: sled::Tree,
    // donation id \0 seq -> EntryRef
    pub(crate) by_donation: sled::Tree,
    // orphanage id \0 seq -> EntryRef
    pub(crate) by_orphanage: sled::Tree,
}

impl DistributionHistory {
    pub(crate) fn open(db: &sled::Db) -> sled::Result<Self> {
        Ok(Self {
            db: db.clone(),
            entries: db.open_tree(HISTORY)?,
            by_donation: db.open_tree(HISTORY_BY_DONATION)?,
            by_orphanage: db.open_tree(HISTORY_BY_ORPHANAGE)?,
        })
    }

    pub(crate) fn stage(&self, entry: HistoryEntry) -> Result<StagedEntry, DistributionError> {
        let (digest, record) = entry.build()?;
        let seq = self.db.generate_id()?.to_be_bytes();
        let donation_key = compound_key(&[entry.donation_id.as_bytes(), &seq]);
        let orphanage_key = entry
            .orphanage_id
            .as_ref()
            .map(|orphanage_id| compound_key(&[orphanage_id.as_bytes(), &seq]));
        let entry_ref = encode(&EntryRef {
            entry_id: entry.id.clone(),
            digest,
        })?;

        Ok(StagedEntry {
            entry,
            record,
            donation_key,
            orphanage_key,
            entry_ref,
        })
    }

    /// Look up one entry, checked against the digest held by its donation index row.
    pub fn get(&self, id: &str) -> Result<Option<HistoryEntry>, DistributionError> {
        let Some(record) = self.entries.get(id.as_bytes())? else {
            return Ok(None);
        };
        let claimed: HistoryEntry = decode(&record)?;
        for row in self
            .by_donation
            .scan_prefix(key_prefix(&[claimed.donation_id.as_bytes()]))
        {
            let (_, value) = row?;
            let entry_ref: EntryRef = decode(&value)?;
            if entry_ref.entry_id == id {
                return self.verified(&entry_ref).map(Some);
            }
        }
        error!(entry_id = id, "history entry has no index row");
        Err(DistributionError::Internal(format!("history entry {id} is not indexed")))
    }

    /// Every decision taken on a donation, oldest first.
    pub fn for_donation(&self, donation_id: &str) -> Result<Vec<HistoryEntry>, DistributionError> {
        self.collect(&self.by_donation, donation_id)
    }

    /// Distributions accepted for an orphanage, newest first.
    pub fn accepted_for_orphanage(
        &self,
        orphanage_id: &str,
    ) -> Result<Vec<HistoryEntry>, DistributionError> {
        let mut entries = self.collect(&self.by_orphanage, orphanage_id)?;
        entries.retain(|e| e.action == HistoryAction::Accepted);
        entries.reverse();
        Ok(entries)
    }

    fn collect(
        &self,
        index: &sled::Tree,
        owner: &str,
    ) -> Result<Vec<HistoryEntry>, DistributionError> {
        let mut entries = vec![];
        for row in index.scan_prefix(key_prefix(&[owner.as_bytes()])) {
            let (_, value) = row?;
            let entry_ref: EntryRef = decode(&value)?;
            entries.push(self.verified(&entry_ref)?);
        }
        Ok(entries)
    }

    fn verified(&self, entry_ref: &EntryRef) -> Result<HistoryEntry, DistributionError> {
        let Some(record) = self.entries.get(entry_ref.entry_id.as_bytes())? else {
            return Err(DistributionError::Internal(format!(
                "history entry {} is indexed but missing",
                entry_ref.entry_id
            )));
        };
        if sha256::digest(record.as_ref()) != entry_ref.digest {
            error!(entry_id = %entry_ref.entry_id, "history entry failed integrity check");
            return Err(DistributionError::Internal(format!(
                "history entry {} failed integrity check",
                entry_ref.entry_id
            )));
        }
        decode(&record)
    }
}

/// History trees as seen from inside a decision transaction.
pub(crate) struct HistoryTx<'a> {
    pub entries: &'a TransactionalTree,
    pub by_donation: &'a TransactionalTree,
    pub by_orphanage: &'a TransactionalTree,
}

impl HistoryTx<'_> {
    pub fn append(
        &self,
        staged: &StagedEntry,
    ) -> ConflictableTransactionResult<(), DistributionError> {
        let previous = self
            .entries
            .insert(staged.entry.id.as_bytes(), staged.record.as_slice())?;
        if previous.is_some() {
            return Err(ConflictableTransactionError::Abort(DistributionError::Internal(
                format!("history entry {} already exists", staged.entry.id),
            )));
        }
        self.by_donation
            .insert(staged.donation_key.as_slice(), staged.entry_ref.as_slice())?;
        if let Some(key) = &staged.orphanage_key {
            self.by_orphanage
                .insert(key.as_slice(), staged.entry_ref.as_slice())?;
        }
        Ok(())
    }
}
