//! HTTP surface: the scheduler-framework extension-point webhooks and the
//! read-only inspect routes.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use poem::get;
use poem::handler;
use poem::post;
use poem::web::Data;
use poem::web::Json;
use poem::web::Path;
use poem::web::Query;
use poem::EndpointExt;
use poem::Route;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use serde_json::Value;

use crate::framework::NodeInfo;
use crate::framework::Status;
use crate::inspect::Inspector;
use crate::plugin::GcuSharePlugin;

/// Component version reported by the version route.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Deserialize)]
pub struct FilterArgs {
    pub pod: Pod,
    #[serde(flatten)]
    pub node_info: NodeInfo,
}

#[derive(Debug, Deserialize)]
pub struct BindArgs {
    pub pod: Pod,
    #[serde(rename = "nodeName")]
    pub node_name: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct InspectQuery {
    #[serde(default)]
    pub drs: Option<String>,
}

impl InspectQuery {
    fn drs(&self) -> bool {
        self.drs.as_deref() == Some("true")
    }
}

#[derive(Serialize)]
struct VersionResponse {
    name: &'static str,
    version: &'static str,
}

#[handler]
async fn filter(plugin: Data<&Arc<GcuSharePlugin>>, Json(args): Json<FilterArgs>) -> Json<Status> {
    Json(plugin.filter(&args.pod, &args.node_info).await)
}

#[handler]
async fn reserve(plugin: Data<&Arc<GcuSharePlugin>>, Json(args): Json<BindArgs>) -> Json<Status> {
    Json(plugin.reserve(&args.pod, &args.node_name).await)
}

#[handler]
async fn unreserve(plugin: Data<&Arc<GcuSharePlugin>>, Json(args): Json<BindArgs>) -> Json<Status> {
    plugin.unreserve(&args.pod, &args.node_name);
    Json(Status::success())
}

#[handler]
async fn pre_bind(plugin: Data<&Arc<GcuSharePlugin>>, Json(args): Json<BindArgs>) -> Json<Status> {
    Json(plugin.pre_bind(&args.pod, &args.node_name).await)
}

#[handler]
async fn bind(plugin: Data<&Arc<GcuSharePlugin>>, Json(args): Json<BindArgs>) -> Json<Status> {
    Json(plugin.bind(&args.pod, &args.node_name).await)
}

#[handler]
async fn inspect_all(
    inspector: Data<&Arc<Inspector>>,
    Query(query): Query<InspectQuery>,
) -> Json<Value> {
    match inspector.inspect_all(query.drs()).await {
        Ok(nodes) => Json(json!(nodes)),
        Err(error) => Json(json!({ "error": error })),
    }
}

#[handler]
async fn inspect_node(
    inspector: Data<&Arc<Inspector>>,
    Path(node_name): Path<String>,
    Query(query): Query<InspectQuery>,
) -> Json<Value> {
    Json(json!(inspector.inspect_node(&node_name, query.drs()).await))
}

#[handler]
async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        name: "gcushare-scheduler-plugin",
        version: VERSION,
    })
}

/// Builds the full route table. A panic inside any handler is caught by the
/// middleware and answered as 500 rather than killing the server.
pub fn routes(plugin: Arc<GcuSharePlugin>, inspector: Arc<Inspector>) -> impl poem::Endpoint {
    Route::new()
        .at("/gcushare-scheduler/filter", post(filter))
        .at("/gcushare-scheduler/reserve", post(reserve))
        .at("/gcushare-scheduler/unreserve", post(unreserve))
        .at("/gcushare-scheduler/prebind", post(pre_bind))
        .at("/gcushare-scheduler/bind", post(bind))
        .at("/gcushare-scheduler/inspect", get(inspect_all))
        .at("/gcushare-scheduler/inspect/:nodename", get(inspect_node))
        .at("/gcushare-scheduler/version", get(version))
        .data(plugin)
        .data(inspector)
        .with(poem::middleware::CatchPanic::new())
        .with(poem::middleware::Tracing)
}
