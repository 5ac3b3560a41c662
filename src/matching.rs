//! Policies deciding which pending requests an accepted donation fulfils
use super::donation::Donation;
use super::request::OrphanageRequest;

/// Called only for pending requests between the receiving orphanage and the deciding NGO.
pub trait RequestMatcher: Send + Sync {
    fn matches(&self, donation: &Donation, request: &OrphanageRequest) -> bool;
}

/// Any request of the same kind is considered fulfilled, whatever its amount or item.
#[derive(Debug, Default, Clone, Copy)]
pub struct SameKind;

impl RequestMatcher for SameKind {
    fn matches(&self, donation: &Donation, request: &OrphanageRequest) -> bool {
        donation.kind() == request.kind()
    }
}

/// Only requests asking for exactly what was donated.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExactPayload;

impl RequestMatcher for ExactPayload {
    fn matches(&self, donation: &Donation, request: &OrphanageRequest) -> bool {
        donation.payload == request.payload
    }
}
