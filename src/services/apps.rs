//! App store catalog.
use tracing::instrument;
use uuid::Uuid;

use super::{first_row, ServiceResult};
use crate::gateway::ApiGateway;
use crate::model::{App, Bundle};
use crate::services::decode_rows;
use crate::supabase::Query;

#[instrument(skip_all)]
pub async fn catalog(gw: &ApiGateway) -> ServiceResult<Vec<App>> {
    let res = gw.query("apps", &Query::new().order("name", true)).await?;
    Ok(decode_rows(&res.data)?)
}

#[instrument(skip_all)]
pub async fn bundles(gw: &ApiGateway) -> ServiceResult<Vec<Bundle>> {
    let res = gw.query("bundles", &Query::new().order("name", true)).await?;
    Ok(decode_rows(&res.data)?)
}

/// Apps included in a bundle, in catalog order.
#[instrument(skip_all)]
pub async fn bundle_apps(gw: &ApiGateway, bundle_id: Uuid) -> ServiceResult<Vec<App>> {
    let res = gw
        .query("bundles", &Query::new().eq("id", bundle_id).limit(1))
        .await?;
    let bundle: Bundle = first_row(&res.data, "bundle", bundle_id)?;
    Ok(catalog(gw)
        .await?
        .into_iter()
        .filter(|app| bundle.app_ids.contains(&app.id))
        .collect())
}
