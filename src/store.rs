//! sled backed storage shared by every component
use super::config::StoreConfig;
use super::directory::Directory;
use super::donation::DonationStore;
use super::error::DistributionError;
use super::history::DistributionHistory;
use super::request::RequestLedger;
use super::utils::new_uuid_to_bech32;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult};
use tracing::info;

/// All trees live in one database so that a decision can span them in a single transaction.
pub struct Store {
    db: sled::Db,
    directory: Directory,
    donations: DonationStore,
    requests: RequestLedger,
    history: DistributionHistory,
}

impl Store {
    pub fn open(config: &StoreConfig) -> Result<Self, DistributionError> {
        let db = sled::Config::new()
            .path(&config.db_path)
            .cache_capacity(config.cache_capacity)
            .temporary(config.temporary)
            .open()?;

        info!(path = %config.db_path.display(), temporary = config.temporary, "store opened");

        Self::from_db(db)
    }

    /// Wrap an already opened database, creating any missing trees.
    pub fn from_db(db: sled::Db) -> Result<Self, DistributionError> {
        Ok(Self {
            directory: Directory::open(&db)?,
            donations: DonationStore::open(&db)?,
            requests: RequestLedger::open(&db)?,
            history: DistributionHistory::open(&db)?,
            db,
        })
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }
    pub fn donations(&self) -> &DonationStore {
        &self.donations
    }
    pub fn requests(&self) -> &RequestLedger {
        &self.requests
    }
    pub fn history(&self) -> &DistributionHistory {
        &self.history
    }

    pub fn flush(&self) -> Result<usize, DistributionError> {
        Ok(self.db.flush()?)
    }
}

pub(crate) fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, DistributionError> {
    Ok(minicbor::to_vec(value)?)
}

pub(crate) fn decode<T>(bytes: &[u8]) -> Result<T, DistributionError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    Ok(minicbor::decode(bytes)?)
}

pub(crate) fn new_id(hrp: &str) -> Result<String, DistributionError> {
    new_uuid_to_bech32(hrp).map_err(|e| DistributionError::Internal(format!("id generation: {e}")))
}

/// Lift a domain result into a transaction result that aborts on error.
pub(crate) fn or_abort<T, E>(
    result: Result<T, E>,
) -> ConflictableTransactionResult<T, DistributionError>
where
    E: Into<DistributionError>,
{
    result.map_err(|e| ConflictableTransactionError::Abort(e.into()))
}
