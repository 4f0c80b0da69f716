//! Operational listing of catalog items with their evaluations, and the
//! public read-path filter.

use reelgate_core::{
    EvaluationStatus, MediaCatalogEvaluation, MediaSignals, MediaType, ReadMode,
};
use reelgate_storage::{CatalogQuery, EvaluationQuery};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{CatalogEngine, EngineResult};

const REVIEW_PAGE: usize = 200;
const MAX_REVIEW_LIMIT: usize = 1_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemReviewQuery {
    /// Defaults to the active version.
    #[serde(default)]
    pub policy_version: Option<i32>,
    #[serde(default)]
    pub status: Option<EvaluationStatus>,
    #[serde(default)]
    pub media_type: Option<MediaType>,
    #[serde(default)]
    pub origin_country: Option<String>,
    #[serde(default)]
    pub after: Option<Uuid>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewedItem {
    pub media_item_id: Uuid,
    pub title: String,
    pub media_type: MediaType,
    pub origin_countries: Vec<String>,
    pub original_language: Option<String>,
    pub is_ready: bool,
    pub is_deleted: bool,
    /// `None` means never evaluated under the version.
    pub evaluation: Option<MediaCatalogEvaluation>,
}

impl ReviewedItem {
    fn new(item: MediaSignals, evaluation: Option<MediaCatalogEvaluation>) -> Self {
        Self {
            media_item_id: item.media_item_id,
            title: item.title,
            media_type: item.media_type,
            origin_countries: item.origin_countries,
            original_language: item.original_language,
            is_ready: item.is_ready,
            is_deleted: item.is_deleted,
            evaluation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemPage {
    pub policy_version: Option<i32>,
    pub items: Vec<ReviewedItem>,
    pub next_cursor: Option<Uuid>,
}

impl CatalogEngine {
    /// Every catalog item, ready or not, joined with its evaluation.
    pub async fn list_items(&self, query: &ItemReviewQuery) -> EngineResult<ItemPage> {
        let limit = query.limit.unwrap_or(50).clamp(1, MAX_REVIEW_LIMIT);
        let policy_version = match query.policy_version {
            Some(version) => Some(self.policy_by_version(version).await?.version),
            None => self.active_policy().await?.map(|p| p.version),
        };

        let mut items = Vec::new();
        let mut after = query.after;
        while items.len() < limit {
            let mut page_query = CatalogQuery::evaluable(after, REVIEW_PAGE, None);
            page_query.include_unready = true;
            page_query.media_type = query.media_type;
            page_query.origin_country = query.origin_country.clone();
            let page = self.stores().catalog.fetch_page(&page_query).await?;
            let exhausted = page.len() < REVIEW_PAGE;
            let Some(last) = page.last() else { break };
            after = Some(last.media_item_id);

            let ids: Vec<Uuid> = page.iter().map(|item| item.media_item_id).collect();
            let mut evaluations = match policy_version {
                Some(version) => self.stores().evaluations.get_many(&ids, version).await?,
                None => Default::default(),
            };
            for item in page {
                let evaluation = evaluations.remove(&item.media_item_id);
                if let Some(status) = query.status {
                    if evaluation.as_ref().map(|e| e.status) != Some(status) {
                        continue;
                    }
                }
                items.push(ReviewedItem::new(item, evaluation));
                if items.len() == limit {
                    break;
                }
            }
            if exhausted {
                break;
            }
        }

        let next_cursor = if items.len() == limit {
            items.last().map(|i| i.media_item_id)
        } else {
            None
        };
        Ok(ItemPage {
            policy_version,
            items,
            next_cursor,
        })
    }

    /// Rows of the active version admitted by `mode`; empty before the first activation.
    pub async fn visible_items(
        &self,
        mode: ReadMode,
        after: Option<Uuid>,
        limit: usize,
    ) -> EngineResult<Vec<MediaCatalogEvaluation>> {
        let Some(active) = self.active_policy().await? else {
            return Ok(Vec::new());
        };
        let mut query = EvaluationQuery::for_version(active.version, limit.clamp(1, MAX_REVIEW_LIMIT));
        query.read_mode = Some(mode);
        query.homepage_min_score = active.config.homepage_min_score;
        query.after = after;
        Ok(self.stores().evaluations.list(&query).await?)
    }
}
