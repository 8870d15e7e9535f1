//! Config watcher.
//!
//! Mirrors the singleton Config object into the shared [`ConfigStore`].
//! The first observation releases the startup barrier every other
//! controller blocks on.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::controller::context::Context;
use crate::controller::error::Error;
use crate::crd::{Config, CONFIG_NAME};

pub async fn reconcile(obj: Arc<Config>, ctx: Arc<Context>) -> Result<Action, Error> {
    if obj.name_any() != CONFIG_NAME {
        warn!(name = %obj.name_any(), "Ignoring non-singleton Config object");
        return Ok(Action::await_change());
    }

    debug!(name = %obj.name_any(), "Observed config");
    ctx.config.set(obj.spec.clone());
    Ok(Action::await_change())
}

pub fn error_policy(_obj: Arc<Config>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(error = %error, "Config watcher error");
    Action::requeue(Duration::from_secs(30))
}
