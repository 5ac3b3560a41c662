//! Shared value types: timestamps, party roles and donation/request payloads
use super::error::ValidationError;
use chrono::{DateTime, TimeZone, Utc};

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

// chrono's zone types are not Ord, so a derive would never apply to TimeStamp<Utc>
impl Ord for TimeStamp<Utc> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for TimeStamp<Utc> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        min: u32,
        sec: u32,
    ) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(Self)
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Role {
    #[n(0)]
    Donor,
    #[n(1)]
    Ngo,
    #[n(2)]
    Orphanage,
}

impl Role {
    /// Stable tag used inside index keys
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Donor => "donor",
            Role::Ngo => "ngo",
            Role::Orphanage => "orphanage",
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, Ord, PartialEq, PartialOrd)]
pub enum Kind {
    #[n(0)]
    Money,
    #[n(1)]
    Item,
}

/// What is pledged or asked for. The variant fixes the kind, so a record can never carry
/// both an amount and an item.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Eq, PartialEq)]
pub enum Payload {
    #[n(0)]
    Money {
        #[n(0)]
        amount: u64, // smallest currency unit
    },
    #[n(1)]
    Item {
        #[n(0)]
        item_name: String,
        #[n(1)]
        count: u32,
    },
}

impl Payload {
    pub fn money(amount: u64) -> Self {
        Payload::Money { amount }
    }
    pub fn item(item_name: impl Into<String>, count: u32) -> Self {
        Payload::Item {
            item_name: item_name.into(),
            count,
        }
    }
    pub fn kind(&self) -> Kind {
        match self {
            Payload::Money { .. } => Kind::Money,
            Payload::Item { .. } => Kind::Item,
        }
    }
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Payload::Money { amount } if *amount == 0 => Err(ValidationError::ZeroAmount),
            Payload::Money { .. } => Ok(()),
            Payload::Item { item_name, .. } if item_name.trim().is_empty() => {
                Err(ValidationError::MissingField("itemName"))
            }
            Payload::Item { count, .. } if *count == 0 => Err(ValidationError::ZeroCount),
            Payload::Item { .. } => Ok(()),
        }
    }
}
