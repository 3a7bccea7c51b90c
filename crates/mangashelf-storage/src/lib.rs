pub mod storage;

pub use storage::{
    normalize_extension, page_file_name, PageStorage, PageStore, StorageError, StorageStats,
    StoredPage,
};
