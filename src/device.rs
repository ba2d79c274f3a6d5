use super::*;
use bitmap::Allocator;
use blk_cch::BlockCache;
use super_blk::Geometry;

use std::sync::Arc;

/// A mounted device: what a directory needs to reach its blocks and its
/// allocator.
pub struct Device {
    devno: u32,
    geo: Arc<Geometry>,
    cache: Arc<BlockCache>,
    alloc: Allocator,
}

impl Device {
    pub fn new(devno: u32, geo: Arc<Geometry>, cache: Arc<BlockCache>, alloc: Allocator) -> Self {
        Self {
            devno,
            geo,
            cache,
            alloc,
        }
    }

    pub fn devno(&self) -> u32 {
        self.devno
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    pub fn alloc(&self) -> &Allocator {
        &self.alloc
    }
}
