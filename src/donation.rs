//! Donation records and their store
use super::error::{DistributionError, ValidationError};
use super::store::{decode, encode, new_id};
use super::types::{Kind, Payload, TimeStamp};
use super::utils::{DONATION_HRP, compound_key, key_prefix};
use chrono::Utc;
use sled::transaction::{TransactionError, Transactional};
use tracing::{debug, instrument};

const DONATIONS: &str = "donations";
const DONATIONS_BY_NGO: &str = "donations_by_ngo";
const DONATIONS_BY_DONOR: &str = "donations_by_donor";

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum DonationStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Distributed,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Eq, PartialEq)]
pub struct Donation {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub donor_id: String,
    #[n(2)]
    pub ngo_id: String,
    #[n(3)]
    pub payload: Payload,
    #[n(4)]
    pub status: DonationStatus,
    #[n(5)]
    pub distributed_to_name: Option<String>, // only set once distributed
    #[n(6)]
    pub created_at: TimeStamp<Utc>,
}

impl Donation {
    pub fn kind(&self) -> Kind {
        self.payload.kind()
    }
    pub fn is_pending(&self) -> bool {
        self.status == DonationStatus::Pending
    }
    pub(crate) fn distributed_to(&self, orphanage_name: &str) -> Self {
        Self {
            status: DonationStatus::Distributed,
            distributed_to_name: Some(orphanage_name.to_string()),
            ..self.clone()
        }
    }
}

/// Used for constructing pledges before they are stored
#[derive(Debug, Default, Clone)]
pub struct DonationDraft {
    donor_id: Option<String>,
    ngo_id: Option<String>,
    payload: Option<Payload>,
}

impl DonationDraft {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_donor(mut self, donor_id: impl Into<String>) -> Self {
        self.donor_id = Some(donor_id.into());
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
    pub fn set_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Checks fields and returns a new PENDING donation.
    pub fn validate_and_finalise(&self) -> Result<Donation, DistributionError> {
        let donor_id = required(&self.donor_id, "donorId")?;
        let ngo_id = required(&self.ngo_id, "ngoId")?;
        let payload = self
            .payload
            .clone()
            .ok_or(ValidationError::MissingField("type"))?;
        payload.validate()?;

        Ok(Donation {
            id: new_id(DONATION_HRP)?,
            donor_id,
            ngo_id,
            payload,
            status: DonationStatus::Pending,
            distributed_to_name: None,
            created_at: TimeStamp::new(),
        })
    }
}

fn required(value: &Option<String>, field: &'static str) -> Result<String, ValidationError> {
    match value.as_deref() {
        Some(v) if v.contains('\0') => Err(ValidationError::ReservedCharacter(field)),
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(ValidationError::MissingField(field)),
    }
}

pub struct DonationStore {
    donations: sled::Tree,
    // ngo id \0 donation id
    by_ngo: sled::Tree,
    // donor id \0 donation id
    by_donor: sled::Tree,
}

impl DonationStore {
    pub(crate) fn open(db: &sled::Db) -> sled::Result<Self> {
        Ok(Self {
            donations: db.open_tree(DONATIONS)?,
            by_ngo: db.open_tree(DONATIONS_BY_NGO)?,
            by_donor: db.open_tree(DONATIONS_BY_DONOR)?,
        })
    }

    /// Tree holding the donation records; decisions update it transactionally.
    pub(crate) fn tree(&self) -> &sled::Tree {
        &self.donations
    }

    #[instrument(
        skip(self, donation),
        fields(donation_id = %donation.id, ngo_id = %donation.ngo_id)
    )]
    pub(crate) fn insert(&self, donation: &Donation) -> Result<(), DistributionError> {
        let record = encode(donation)?;
        let ngo_key = compound_key(&[donation.ngo_id.as_bytes(), donation.id.as_bytes()]);
        let donor_key = compound_key(&[donation.donor_id.as_bytes(), donation.id.as_bytes()]);

        let result: Result<(), TransactionError<DistributionError>> =
            (&self.donations, &self.by_ngo, &self.by_donor).transaction(
                |(donations, by_ngo, by_donor)| {
                    donations.insert(donation.id.as_bytes(), record.as_slice())?;
                    by_ngo.insert(ngo_key.as_slice(), &[] as &[u8])?;
                    by_donor.insert(donor_key.as_slice(), &[] as &[u8])?;
                    Ok(())
                },
            );
        result?;

        debug!("donation stored");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Donation>, DistributionError> {
        self.donations
            .get(id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Donations addressed to an NGO, newest first.
    pub fn for_ngo(&self, ngo_id: &str) -> Result<Vec<Donation>, DistributionError> {
        self.collect(&self.by_ngo, ngo_id)
    }

    /// Donations pledged by a donor, newest first.
    pub fn for_donor(&self, donor_id: &str) -> Result<Vec<Donation>, DistributionError> {
        self.collect(&self.by_donor, donor_id)
    }

    fn collect(&self, index: &sled::Tree, owner: &str) -> Result<Vec<Donation>, DistributionError> {
        let prefix = key_prefix(&[owner.as_bytes()]);
        let mut donations = vec![];
        for entry in index.scan_prefix(&prefix) {
            let (key, _) = entry?;
            let id = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            if let Some(donation) = self.get(&id)? {
                donations.push(donation);
            }
        }
        donations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(donations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drafts_start_pending() {
        let donation = DonationDraft::new()
            .set_donor("party_donor")
            .set_ngo("party_ngo")
            .set_money(100)
            .validate_and_finalise()
            .unwrap();

        assert_eq!(donation.status, DonationStatus::Pending);
        assert!(donation.distributed_to_name.is_none());
        assert_eq!(donation.kind(), Kind::Money);
    }

    #[test]
    fn drafts_require_every_field() {
        let err = DonationDraft::new().set_ngo("n").set_money(1).validate_and_finalise();
        assert!(matches!(
            err,
            Err(DistributionError::Validation(ValidationError::MissingField("donorId")))
        ));
        let err = DonationDraft::new().set_donor("d").set_ngo("n").validate_and_finalise();
        assert!(matches!(
            err,
            Err(DistributionError::Validation(ValidationError::MissingField("type")))
        ));
    }

    #[test]
    fn distributing_keeps_identity() {
        let donation = DonationDraft::new()
            .set_donor("d")
            .set_ngo("n")
            .set_item("blankets", 12)
            .validate_and_finalise()
            .unwrap();
        let distributed = donation.distributed_to("Orphan House");

        assert_eq!(distributed.id, donation.id);
        assert_eq!(distributed.payload, donation.payload);
        assert_eq!(distributed.status, DonationStatus::Distributed);
        assert_eq!(distributed.distributed_to_name.as_deref(), Some("Orphan House"));
    }

    #[test]
    fn listings_are_newest_first() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let store = DonationStore::open(&db).unwrap();

        let pledged_at = |hour| {
            let mut donation = DonationDraft::new()
                .set_donor("donor_a")
                .set_ngo("ngo_a")
                .set_money(10)
                .validate_and_finalise()
                .unwrap();
            donation.created_at = TimeStamp::new_with(2024, 3, 1, hour, 0, 0).unwrap();
            donation
        };
        let older = pledged_at(8);
        let newer = pledged_at(17);
        // insertion order is the reverse of creation order
        store.insert(&newer).unwrap();
        store.insert(&older).unwrap();

        assert_eq!(store.for_ngo("ngo_a").unwrap(), vec![newer.clone(), older.clone()]);
        assert_eq!(store.for_donor("donor_a").unwrap(), vec![newer, older]);
    }

    #[test]
    fn listing_by_owner() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let store = DonationStore::open(&db).unwrap();

        for amount in [10, 20] {
            let donation = DonationDraft::new()
                .set_donor("donor_a")
                .set_ngo("ngo_a")
                .set_money(amount)
                .validate_and_finalise()
                .unwrap();
            store.insert(&donation).unwrap();
        }
        let other = DonationDraft::new()
            .set_donor("donor_b")
            .set_ngo("ngo_a")
            .set_money(5)
            .validate_and_finalise()
            .unwrap();
        store.insert(&other).unwrap();

        assert_eq!(store.for_ngo("ngo_a").unwrap().len(), 3);
        assert_eq!(store.for_donor("donor_a").unwrap().len(), 2);
        assert!(store.for_donor("donor").unwrap().is_empty());
    }
}
