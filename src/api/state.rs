use std::sync::Arc;

use crate::denylist::Denylist;
use crate::detect::engine::AnomalyEngine;
use crate::detect::flagger::SuspicionLedger;
use crate::geo::GeoLocator;
use crate::scheduler::Scheduler;
use crate::storage::Pool;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub denylist: Denylist,
    pub ledger: SuspicionLedger,
    pub geo: Arc<GeoLocator>,
    pub engine: Arc<AnomalyEngine>,
    pub scheduler: Scheduler,
}
