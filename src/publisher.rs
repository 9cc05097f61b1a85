use std::{
    fs,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use crossbeam_channel::Sender;
use reqwest::{
    blocking::Client,
    header::{CONTENT_TYPE, LOCATION},
};

use crate::{
    config::UploadTarget,
    error::{CaptureError, StoreError},
    types::{CapturedPhoto, PhotoSlot, StoredPhoto},
};

/// Where captured photos end up on the user's profile.
pub trait PhotoStore: Send + Sync + 'static {
    fn store(&self, slot: PhotoSlot, jpeg: &[u8]) -> Result<StoredPhoto, StoreError>;
}

pub fn store_for(target: &UploadTarget, user_id: &str) -> Arc<dyn PhotoStore> {
    match target {
        UploadTarget::Directory(root) => Arc::new(DirectoryPhotoStore::new(root.clone(), user_id)),
        UploadTarget::Http { base_url, token } => {
            Arc::new(HttpPhotoStore::new(base_url, user_id, token.clone()))
        }
    }
}

pub struct HttpPhotoStore {
    client: Client,
    base_url: String,
    user_id: String,
    token: Option<String>,
}

impl HttpPhotoStore {
    pub fn new(base_url: &str, user_id: &str, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            user_id: user_id.to_string(),
            token,
        }
    }

    pub fn endpoint(&self, slot: PhotoSlot) -> String {
        format!(
            "{}/users/{}/{}",
            self.base_url,
            self.user_id,
            slot.field_name()
        )
    }
}

impl PhotoStore for HttpPhotoStore {
    fn store(&self, slot: PhotoSlot, jpeg: &[u8]) -> Result<StoredPhoto, StoreError> {
        let url = self.endpoint(slot);
        let mut request = self
            .client
            .put(&url)
            .header(CONTENT_TYPE, "image/jpeg")
            .body(jpeg.to_vec());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Rejected {
                status: status.as_u16(),
            });
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .unwrap_or(url);
        Ok(StoredPhoto { slot, location })
    }
}

/// Writes `{root}/{user}/{field}.jpg`, replacing any earlier capture.
pub struct DirectoryPhotoStore {
    dir: PathBuf,
}

impl DirectoryPhotoStore {
    pub fn new(root: PathBuf, user_id: &str) -> Self {
        Self {
            dir: root.join(user_id),
        }
    }
}

impl PhotoStore for DirectoryPhotoStore {
    fn store(&self, slot: PhotoSlot, jpeg: &[u8]) -> Result<StoredPhoto, StoreError> {
        fs::create_dir_all(&self.dir)?;
        let dest = self.dir.join(format!("{}.jpg", slot.field_name()));
        let tmp = dest.with_extension("jpg.part");
        fs::write(&tmp, jpeg)?;
        fs::rename(&tmp, &dest)?;

        Ok(StoredPhoto {
            slot,
            location: dest.display().to_string(),
        })
    }
}

#[derive(Debug)]
pub struct PersistOutcome {
    pub ticket: u64,
    pub slot: PhotoSlot,
    pub result: Result<StoredPhoto, StoreError>,
}

/// Uploads photos off the coordinating thread and reports back on
/// `outcome_tx`. Nothing is reported once cancelled.
pub struct ResultPublisher {
    store: Arc<dyn PhotoStore>,
    outcome_tx: Sender<PersistOutcome>,
    cancelled: Arc<AtomicBool>,
}

impl ResultPublisher {
    pub fn new(store: Arc<dyn PhotoStore>, outcome_tx: Sender<PersistOutcome>) -> Self {
        Self {
            store,
            outcome_tx,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn persist(&self, ticket: u64, photo: CapturedPhoto) {
        let store = self.store.clone();
        let outcome_tx = self.outcome_tx.clone();
        let cancelled = self.cancelled.clone();
        let slot = photo.slot;

        log::info!(
            "uploading {slot} ({} bytes, {}x{})",
            photo.image.jpeg.len(),
            photo.image.width,
            photo.image.height
        );
        thread::spawn(move || {
            let result = store.store(slot, &photo.image.jpeg);
            if cancelled.load(Ordering::SeqCst) {
                log::debug!("dropping {slot} upload result after cancellation");
                return;
            }
            let _ = outcome_tx.send(PersistOutcome {
                ticket,
                slot,
                result,
            });
        });
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl Drop for ResultPublisher {
    fn drop(&mut self) {
        self.cancel();
    }
}

type CompletionFn = Box<dyn FnOnce(Result<(), CaptureError>) + Send>;

/// The single terminal callback handed to the onboarding flow.
pub struct Completion {
    callback: Option<CompletionFn>,
}

impl Completion {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(Result<(), CaptureError>) + Send + 'static,
    {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    /// Returns `false` if the callback already fired.
    pub fn fire(&mut self, result: Result<(), CaptureError>) -> bool {
        match self.callback.take() {
            Some(callback) => {
                callback(result);
                true
            }
            None => {
                log::warn!("completion already delivered, dropping {result:?}");
                false
            }
        }
    }

    pub fn is_fired(&self) -> bool {
        self.callback.is_none()
    }
}
