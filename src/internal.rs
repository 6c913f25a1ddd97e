pub mod block_list;
pub mod slab;
pub mod space_bitmap;
