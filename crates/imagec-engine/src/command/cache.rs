//! `$imageCache`: store or load the active image under a memory slot.

use serde::{Deserialize, Serialize};

use crate::context::ProcessContext;
use crate::error::CommandError;
use crate::types::{CacheScope, MemoryId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheMode {
    #[default]
    Store,
    Load,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageCacheSettings {
    pub mode: CacheMode,
    pub memory_id: MemoryId,
    pub scope: CacheScope,
    /// Key the entry under this c-stack instead of the pipeline's own.
    pub c_stack_index: Option<i32>,
}

impl ImageCacheSettings {
    pub(crate) fn execute(&self, ctx: &mut ProcessContext<'_>) -> Result<(), CommandError> {
        let id = ctx.cache_id(self.memory_id, self.c_stack_index);
        match self.mode {
            CacheMode::Store => {
                let plane = ctx.active_image().clone();
                ctx.store_image_to_cache(self.scope, id, plane);
            }
            CacheMode::Load => {
                let plane = ctx.load_image_from_cache(self.scope, id)?;
                ctx.set_active_image(plane);
            }
        }
        Ok(())
    }
}
