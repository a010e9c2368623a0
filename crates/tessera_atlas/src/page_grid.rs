//! Fixed page grid over the atlas texture
//!
//! The atlas is cut into uniform square pages; each cached glyph owns exactly
//! one page. Because every page has the same size there is nothing to pack and
//! nothing to defragment: the only way to make room is eviction.

use crate::config::AtlasConfig;
use crate::error::{AtlasError, Result};

/// Index of a page in the grid (row-major)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageIndex(pub u32);

impl PageIndex {
    /// The index as a `usize`
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// A rectangle in atlas texel coordinates (top-left origin)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AtlasRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl AtlasRect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// True if the rectangle covers no texels
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Number of texels covered
    #[inline]
    pub const fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Normalized texture coordinates (u_min, v_min, u_max, v_max)
    pub fn uv_bounds(&self, atlas_width: u32, atlas_height: u32) -> [f32; 4] {
        let w = atlas_width.max(1) as f32;
        let h = atlas_height.max(1) as f32;
        [
            self.x as f32 / w,
            self.y as f32 / h,
            (self.x + self.width) as f32 / w,
            (self.y + self.height) as f32 / h,
        ]
    }
}

/// Free/occupied bookkeeping for the atlas pages
#[derive(Debug)]
pub struct PageGrid {
    page_size: u32,
    pages_per_row: u32,
    /// Free pages, used as a stack with the lowest index on top
    free: Vec<u32>,
    occupied: Vec<bool>,
    occupied_count: usize,
}

impl PageGrid {
    /// Create a grid for the given atlas layout with every page free
    pub fn new(config: &AtlasConfig) -> Self {
        let capacity = config.page_capacity();
        Self {
            page_size: config.page_size,
            pages_per_row: config.pages_per_row(),
            free: (0..capacity as u32).rev().collect(),
            occupied: vec![false; capacity],
            occupied_count: 0,
        }
    }

    /// Take a free page, or `None` when the grid is full
    pub fn allocate(&mut self) -> Option<PageIndex> {
        let index = self.free.pop()?;
        self.occupied[index as usize] = true;
        self.occupied_count += 1;
        Some(PageIndex(index))
    }

    /// Return a page to the grid
    pub fn free(&mut self, page: PageIndex) -> Result<()> {
        match self.occupied.get_mut(page.as_usize()) {
            Some(slot) if *slot => {
                *slot = false;
                self.occupied_count -= 1;
                self.free.push(page.0);
                Ok(())
            }
            _ => Err(AtlasError::PageNotAllocated(page.0)),
        }
    }

    /// Texel rectangle covered by a page
    pub fn page_rect(&self, page: PageIndex) -> AtlasRect {
        let col = page.0 % self.pages_per_row;
        let row = page.0 / self.pages_per_row;
        AtlasRect::new(
            col * self.page_size,
            row * self.page_size,
            self.page_size,
            self.page_size,
        )
    }

    /// Whether the page is currently handed out
    pub fn is_occupied(&self, page: PageIndex) -> bool {
        self.occupied.get(page.as_usize()).copied().unwrap_or(false)
    }

    /// Edge length of a page in texels
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Total number of pages
    pub fn capacity(&self) -> usize {
        self.occupied.len()
    }

    /// Number of pages handed out
    pub fn occupied(&self) -> usize {
        self.occupied_count
    }

    /// Number of free pages
    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn is_full(&self) -> bool {
        self.free.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(atlas: u32, page: u32) -> PageGrid {
        PageGrid::new(&AtlasConfig::square(atlas, page))
    }

    #[test]
    fn test_allocates_lowest_index_first() {
        let mut grid = grid(256, 64);
        assert_eq!(grid.capacity(), 16);
        assert_eq!(grid.allocate(), Some(PageIndex(0)));
        assert_eq!(grid.allocate(), Some(PageIndex(1)));
        grid.free(PageIndex(0)).unwrap();
        assert_eq!(grid.allocate(), Some(PageIndex(0)));
        assert_eq!(grid.occupied(), 2);
    }

    #[test]
    fn test_full_grid() {
        let mut grid = grid(128, 64);
        for _ in 0..4 {
            assert!(grid.allocate().is_some());
        }
        assert!(grid.is_full());
        assert_eq!(grid.allocate(), None);
        grid.free(PageIndex(2)).unwrap();
        assert_eq!(grid.allocate(), Some(PageIndex(2)));
    }

    #[test]
    fn test_double_free_rejected() {
        let mut grid = grid(128, 64);
        let page = grid.allocate().unwrap();
        grid.free(page).unwrap();
        assert!(matches!(
            grid.free(page),
            Err(AtlasError::PageNotAllocated(0))
        ));
        assert!(grid.free(PageIndex(99)).is_err());
        assert_eq!(grid.available(), 4);
    }

    #[test]
    fn test_page_rect_is_row_major() {
        let grid = grid(256, 64);
        assert_eq!(grid.page_rect(PageIndex(0)), AtlasRect::new(0, 0, 64, 64));
        assert_eq!(grid.page_rect(PageIndex(3)), AtlasRect::new(192, 0, 64, 64));
        assert_eq!(grid.page_rect(PageIndex(5)), AtlasRect::new(64, 64, 64, 64));
    }

    #[test]
    fn test_uv_bounds() {
        let rect = AtlasRect::new(64, 128, 32, 16);
        assert_eq!(rect.uv_bounds(256, 256), [0.25, 0.5, 0.375, 0.5625]);
    }
}
