//! HTTP routes. The returned router is mounted by the host, typically
//! under `/feature-flags`.

pub mod admin;
pub mod evaluate;
pub mod events;
pub mod meta;

use axum::Router;
use axum::routing::{get, patch, post};

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/flags", get(admin::flags::list).post(admin::flags::create))
        .route(
            "/flags/{flag_id}",
            get(admin::flags::get)
                .patch(admin::flags::update)
                .delete(admin::flags::remove),
        )
        .route("/flags/{flag_id}/enable", post(admin::flags::enable))
        .route("/flags/{flag_id}/disable", post(admin::flags::disable))
        .route(
            "/flags/{flag_id}/rules",
            get(admin::rules::list).post(admin::rules::create),
        )
        .route("/flags/{flag_id}/rules/reorder", post(admin::rules::reorder))
        .route(
            "/flags/{flag_id}/rules/{rule_id}",
            get(admin::rules::get)
                .patch(admin::rules::update)
                .delete(admin::rules::remove),
        )
        .route("/flags/{flag_id}/stats", get(admin::audit::stats))
        .route(
            "/overrides",
            get(admin::overrides::list).post(admin::overrides::create),
        )
        .route(
            "/overrides/{id}",
            get(admin::overrides::get)
                .patch(admin::overrides::update)
                .delete(admin::overrides::remove),
        )
        .route("/metrics/usage", get(admin::audit::usage))
        .route("/audit", get(admin::audit::list))
        .route("/audit/{id}", get(admin::audit::get))
        .route(
            "/environments",
            get(admin::environments::list).post(admin::environments::create),
        )
        .route(
            "/environments/{id}",
            patch(admin::environments::update).delete(admin::environments::remove),
        )
        .route("/export", post(admin::audit::export));

    Router::new()
        .route("/evaluate", post(evaluate::evaluate))
        .route("/evaluate-batch", post(evaluate::evaluate_batch))
        .route("/bootstrap", post(evaluate::bootstrap))
        .route("/events", post(events::submit))
        .route("/events/batch", post(events::submit_batch))
        .route("/config", get(meta::config_descriptor))
        .route("/health", get(meta::health))
        .nest("/admin", admin)
        .with_state(state)
}
