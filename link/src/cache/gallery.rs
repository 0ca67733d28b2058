//! Pairs downloaded images with their metadata

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::cache::images::ImageCache;
use crate::models::{DeviceResponse, ImagePayload};
use crate::transport::{response_handler, state_handler, ConnectionState, DeviceTransport, HandlerId};

#[derive(Debug)]
struct GalleryState {
    cache: Arc<ImageCache>,

    /// Image waiting for its `metadata_result`
    pending: Mutex<Option<ImagePayload>>,
}

impl GalleryState {
    fn handle_response(&self, response: &DeviceResponse) {
        match response {
            DeviceResponse::Image(image) => {
                let previous = self
                    .pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .replace(image.clone());
                // Only complete pairs are cached
                if let Some(previous) = previous {
                    debug!("Dropping {}, no metadata arrived", previous.filename);
                }
            }
            DeviceResponse::ImageMetadata { filename, metadata } => {
                let matched = {
                    let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                    match pending.as_ref() {
                        Some(image) if image.filename == *filename => pending.take(),
                        _ => None,
                    }
                };
                match matched {
                    Some(image) => {
                        if let Some(evicted) = self.cache.insert(image, Some(metadata.clone())) {
                            debug!("Evicted {} from image cache", evicted);
                        }
                    }
                    None => {
                        if !self.cache.set_metadata(filename, metadata.clone()) {
                            debug!("Metadata for {} has no matching image", filename);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn handle_state(&self, state: ConnectionState) {
        if state == ConnectionState::Disconnected {
            let dropped = self.pending.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(image) = dropped {
                debug!("Dropping pending image {}", image.filename);
            }
        }
    }
}

struct Attachment {
    transport: Arc<dyn DeviceTransport>,
    response_id: HandlerId,
    state_id: HandlerId,
}

/// Feeds completed images and their metadata from a transport into an
/// [`ImageCache`]
pub struct ImageGallery {
    state: Arc<GalleryState>,
    attachment: Mutex<Option<Attachment>>,
}

impl ImageGallery {
    pub fn new(cache: Arc<ImageCache>) -> Self {
        Self {
            state: Arc::new(GalleryState {
                cache,
                pending: Mutex::new(None),
            }),
            attachment: Mutex::new(None),
        }
    }

    /// Subscribe to `transport`, replacing any previous subscription
    pub fn attach(&self, transport: Arc<dyn DeviceTransport>) {
        self.detach();

        let state = self.state.clone();
        let response_id = transport.on_response(response_handler(move |response| state.handle_response(response)));
        let state = self.state.clone();
        let state_id = transport.on_connection_state_change(state_handler(move |s| state.handle_state(*s)));

        *self.attachment.lock().unwrap_or_else(|e| e.into_inner()) = Some(Attachment {
            transport,
            response_id,
            state_id,
        });
    }

    /// Unsubscribe from the current transport
    pub fn detach(&self) {
        let attachment = self.attachment.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(attachment) = attachment {
            attachment.transport.off_response(attachment.response_id);
            attachment.transport.off_connection_state_change(attachment.state_id);
        }
    }

    pub fn handle_response(&self, response: &DeviceResponse) {
        self.state.handle_response(response);
    }

    pub fn handle_state(&self, state: ConnectionState) {
        self.state.handle_state(state);
    }

    /// Filename of the image waiting for metadata
    pub fn pending(&self) -> Option<String> {
        self.state
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|image| image.filename.clone())
    }

    pub fn cache(&self) -> &Arc<ImageCache> {
        &self.state.cache
    }
}

impl Drop for ImageGallery {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn image(name: &str) -> DeviceResponse {
        DeviceResponse::Image(ImagePayload::from_base64(name.to_string(), Some(3), "AQID"))
    }

    fn metadata(name: &str) -> DeviceResponse {
        DeviceResponse::ImageMetadata {
            filename: name.to_string(),
            metadata: json!({"cat": "Boots", "confidence": 0.92}),
        }
    }

    #[test]
    fn test_pairs_image_with_metadata() {
        let gallery = ImageGallery::new(Arc::new(ImageCache::new(4)));
        gallery.handle_response(&image("a.jpg"));
        assert_eq!(gallery.pending().as_deref(), Some("a.jpg"));
        assert!(!gallery.cache().contains("a.jpg"));

        gallery.handle_response(&metadata("a.jpg"));
        assert_eq!(gallery.pending(), None);
        let cached = gallery.cache().get("a.jpg").unwrap();
        assert_eq!(cached.metadata.unwrap()["cat"], "Boots");
    }

    #[test]
    fn test_mismatched_metadata_keeps_pending() {
        let gallery = ImageGallery::new(Arc::new(ImageCache::new(4)));
        gallery.handle_response(&image("a.jpg"));
        gallery.handle_response(&metadata("b.jpg"));
        assert_eq!(gallery.pending().as_deref(), Some("a.jpg"));
        assert!(gallery.cache().is_empty());
    }

    #[test]
    fn test_disconnect_clears_pending() {
        let gallery = ImageGallery::new(Arc::new(ImageCache::new(4)));
        gallery.handle_response(&image("a.jpg"));
        gallery.handle_state(ConnectionState::Reconnecting);
        assert!(gallery.pending().is_some());
        gallery.handle_state(ConnectionState::Disconnected);
        assert_eq!(gallery.pending(), None);
    }

    #[test]
    fn test_next_image_drops_unpaired_previous() {
        let gallery = ImageGallery::new(Arc::new(ImageCache::new(4)));
        gallery.handle_response(&image("a.jpg"));
        gallery.handle_response(&image("b.jpg"));
        assert!(!gallery.cache().contains("a.jpg"));
        assert!(gallery.cache().is_empty());
        assert_eq!(gallery.pending().as_deref(), Some("b.jpg"));

        // Late metadata for the dropped image changes nothing
        gallery.handle_response(&metadata("a.jpg"));
        assert!(gallery.cache().get("a.jpg").is_none());

        gallery.handle_response(&metadata("b.jpg"));
        assert!(gallery.cache().get("b.jpg").unwrap().metadata.is_some());
    }
}
