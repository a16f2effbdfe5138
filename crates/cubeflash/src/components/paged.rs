use cubecl::prelude::*;
use cubecl::std::{CubeOption, CubeOptionExpand};

/// Element offset of one K/V cache row.
///
/// With a block table, the cache is `[num_pages, page_size, num_heads_k,
/// head_dim]` and the logical row is routed through the per-batch page
/// indirection; `batch_stride` then strides between pages. Rows of one tile
/// may land on different pages, so resolution happens per row and never
/// assumes contiguity across a page boundary.
///
/// Without a block table, `base_offset` already points at this batch's first
/// cache row and rows are `row_stride` apart.
#[cube]
pub fn kv_row_offset(
    row: u32,
    head_offset: u32,
    base_offset: u32,
    batch_stride: u32,
    row_stride: u32,
    block_table: &CubeOption<Tensor<i32>>,
    table_row_offset: u32,
    page_size: u32,
) -> u32 {
    match block_table {
        CubeOption::Some(table) => {
            let page = row / page_size;
            let in_page = row - page * page_size;
            let physical = u32::cast_from(table[(table_row_offset + page) as usize]);
            physical * batch_stride + in_page * row_stride + head_offset
        }
        CubeOption::None => base_offset + row * row_stride + head_offset,
    }
}
