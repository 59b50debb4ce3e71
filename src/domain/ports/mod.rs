mod image_fetcher_port;

pub use image_fetcher_port::ImageFetcher;

#[cfg(test)]
pub use image_fetcher_port::MockImageFetcher;
