use std::future::Future;

use crate::egress::EgressIdentity;
use crate::error::HarvestError;
use crate::models::{Page, PageRequest, Region, Session};

/// Capabilities one upstream search portal has to provide.
///
/// Every call is told which egress identity to go out through; adapters that
/// keep per-identity state (connections, cookies) key it on the identity's
/// label and generation.
pub trait PortalAdapter: Send + Sync + Clone + 'static {
    /// Obtain a session. Failure here aborts the run.
    fn authenticate(
        &self,
        identity: &EgressIdentity,
    ) -> impl Future<Output = Result<Session, HarvestError>> + Send;

    /// List regions and the sub-categories searchable in each.
    fn enumerate_regions(
        &self,
        session: &Session,
        identity: &EgressIdentity,
    ) -> impl Future<Output = Result<Vec<Region>, HarvestError>> + Send;

    /// Fetch one page of one partition.
    fn fetch_page(
        &self,
        session: &Session,
        identity: &EgressIdentity,
        request: &PageRequest,
    ) -> impl Future<Output = Result<Page, HarvestError>> + Send;
}
