pub mod query;
pub mod response;

use chrono::Utc;
use grafscrape_core::error::Result;
use grafscrape_core::model::point::Tags;

use crate::{Datasource, FetchRequest, Push, Transport};

pub use query::{AggKind, AggNode, MetricOp, QueryPlan, build_plan};
pub use response::{MultiSearchResponse, walk};

const MSEARCH_PATH: &str = "_msearch";
const NDJSON: &str = "application/x-ndjson";
const ALIAS_TAG: &str = "alias";

pub struct Elasticsearch;

impl Datasource for Elasticsearch {
    async fn fetch_series(
        &self,
        transport: &Transport,
        req: &FetchRequest<'_>,
        push: &mut Push<'_>,
    ) -> Result<()> {
        let plan = build_plan(req.target, req.datasource, req.interval)?;
        if plan.roots.is_empty() {
            tracing::debug!(ref_id = %req.target.ref_id, "elasticsearch target has no aggregations");
            return Ok(());
        }

        let window = req.period.resolve();
        let resp: MultiSearchResponse = transport
            .post_text(
                req.datasource,
                MSEARCH_PATH,
                NDJSON,
                plan.msearch_payload(&window),
            )
            .await?;

        let mut tags = Tags::new();
        if let Some(alias) = req.target.str_field("alias").filter(|a| !a.is_empty()) {
            tags.insert(ALIAS_TAG.to_string(), alias.to_string());
        }
        let pushed = response::decode_response(resp, &plan, tags, Utc::now(), push)?;
        tracing::debug!(ref_id = %req.target.ref_id, pushed, "elasticsearch response walked");
        Ok(())
    }
}
