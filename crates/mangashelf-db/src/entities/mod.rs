pub mod download;
pub mod downloaded_page;
pub mod extension;
pub mod library_item;
