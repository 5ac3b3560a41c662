//! Identity directory: parties and their roles
use super::error::{DistributionError, ValidationError};
use super::store::{decode, encode, new_id};
use super::types::{Role, TimeStamp};
use super::utils::{PARTY_HRP, compound_key, key_prefix};
use chrono::Utc;
use sled::transaction::{TransactionError, Transactional};
use tracing::{debug, instrument};

const PARTIES: &str = "parties";
const PARTY_NAMES: &str = "party_names";
const PARTY_ROLES: &str = "party_roles";

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Eq, PartialEq)]
pub struct Party {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub role: Role,
    #[n(2)]
    pub name: String,
    #[n(3)]
    pub email: String,
    #[n(4)]
    pub description: Option<String>,
    #[n(5)]
    pub experience: Option<String>,
    #[n(6)]
    pub created_at: TimeStamp<Utc>,
}

#[derive(Debug, Default, Clone)]
pub struct PartyDraft {
    role: Option<Role>,
    name: Option<String>,
    email: Option<String>,
    description: Option<String>,
    experience: Option<String>,
}

impl PartyDraft {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }
    pub fn set_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
    pub fn set_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
    pub fn set_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
    pub fn set_experience(mut self, experience: impl Into<String>) -> Self {
        self.experience = Some(experience.into());
        self
    }
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.role.is_none() {
            return Err(ValidationError::MissingField("role"));
        }
        let name = self.name.as_deref().ok_or(ValidationError::MissingField("name"))?;
        if name.chars().count() < 2 {
            return Err(ValidationError::NameTooShort);
        }
        if name.contains('\0') {
            return Err(ValidationError::ReservedCharacter("name"));
        }
        match self.email.as_deref() {
            Some(email) if email.contains('@') => Ok(()),
            _ => Err(ValidationError::InvalidEmail),
        }
    }
}

pub struct Directory {
    db: sled::Db,
    parties: sled::Tree,
    // role \0 name \0 seq -> party id
    names: sled::Tree,
    // role \0 seq -> party id
    roles: sled::Tree,
}

impl Directory {
    pub(crate) fn open(db: &sled::Db) -> sled::Result<Self> {
        Ok(Self {
            db: db.clone(),
            parties: db.open_tree(PARTIES)?,
            names: db.open_tree(PARTY_NAMES)?,
            roles: db.open_tree(PARTY_ROLES)?,
        })
    }

    /// Insert a party. Credentials are handled elsewhere; this only records identity.
    #[instrument(skip(self, draft), fields(role = ?draft.role))]
    pub fn register(&self, draft: PartyDraft) -> Result<Party, DistributionError> {
        draft.validate()?;
        let (Some(role), Some(name), Some(email)) = (draft.role, draft.name, draft.email) else {
            return Err(ValidationError::MissingField("role, name and email").into());
        };

        let party = Party {
            id: new_id(PARTY_HRP)?,
            role,
            name,
            email,
            description: draft.description,
            experience: draft.experience,
            created_at: TimeStamp::new(),
        };

        // sequence numbers keep registration order inside the indexes
        let seq = self.db.generate_id()?.to_be_bytes();
        let record = encode(&party)?;
        let name_key = compound_key(&[role.as_str().as_bytes(), party.name.as_bytes(), &seq]);
        let role_key = compound_key(&[role.as_str().as_bytes(), &seq]);

        (&self.parties, &self.names, &self.roles)
            .transaction(|(parties, names, roles)| {
                parties.insert(party.id.as_bytes(), record.as_slice())?;
                names.insert(name_key.as_slice(), party.id.as_bytes())?;
                roles.insert(role_key.as_slice(), party.id.as_bytes())?;
                Ok(())
            })
            .map_err(|e: TransactionError<DistributionError>| DistributionError::from(e))?;

        debug!(party_id = %party.id, "party registered");
        Ok(party)
    }

    pub fn get(&self, id: &str) -> Result<Option<Party>, DistributionError> {
        self.parties
            .get(id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Exact, case sensitive lookup. With duplicate names the earliest registration wins.
    pub fn find_by_name(&self, role: Role, name: &str) -> Result<Option<Party>, DistributionError> {
        if name.contains('\0') {
            return Ok(None);
        }
        let prefix = key_prefix(&[role.as_str().as_bytes(), name.as_bytes()]);
        match self.names.scan_prefix(prefix).next() {
            Some(entry) => {
                let (_, id) = entry?;
                self.get(&String::from_utf8_lossy(&id))
            }
            None => Ok(None),
        }
    }

    /// Resolve an id that must belong to a party with the given role.
    pub fn require(&self, id: &str, role: Role) -> Result<Party, DistributionError> {
        match self.get(id)? {
            Some(party) if party.role == role => Ok(party),
            _ => Err(DistributionError::NotFound(format!(
                "{} {id} not found",
                role.as_str()
            ))),
        }
    }

    /// Parties of one role, newest registration first.
    pub fn list(&self, role: Role) -> Result<Vec<Party>, DistributionError> {
        let mut parties = vec![];
        for entry in self.roles.scan_prefix(key_prefix(&[role.as_str().as_bytes()])).rev() {
            let (_, id) = entry?;
            if let Some(party) = self.get(&String::from_utf8_lossy(&id))? {
                parties.push(party);
            }
        }
        Ok(parties)
    }
}
