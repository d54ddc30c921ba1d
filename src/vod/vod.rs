// SPDX-License-Identifier: GPL-2.0-or-later

mod cache;
mod pool;

pub use cache::PresentationCache;
pub use pool::AssemblyPool;

use adaptive::{LoadError, PlayReadyOptions, Presentation, StreamType};
use common::ArcLogger;
use isom::Fragment;
use playready::DrmType;
use std::{
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GetPresentationError {
    #[error("load: {0}")]
    Load(#[from] LoadError),

    #[error("loader died before answering")]
    LoaderGone,
}

/// Resolves content ids to presentations, loading and caching
/// them on first use.
pub struct ContentStore {
    archive_dir: PathBuf,
    dir_levels: u8,
    playready: PlayReadyOptions,
    allow_clear: bool,
    cache: PresentationCache,
    logger: ArcLogger,
}

impl ContentStore {
    #[must_use]
    pub fn new(
        archive_dir: PathBuf,
        dir_levels: u8,
        cache_size: usize,
        playready: PlayReadyOptions,
        allow_clear: bool,
        logger: ArcLogger,
    ) -> Self {
        Self {
            archive_dir,
            dir_levels,
            playready,
            allow_clear,
            cache: PresentationCache::new(cache_size),
            logger,
        }
    }

    #[must_use]
    pub fn allow_clear(&self) -> bool {
        self.allow_clear
    }

    /// Look up or load the presentation for a request. Loading
    /// parses every source file, so it runs off the async
    /// runtime.
    pub async fn presentation(
        &self,
        content_id: &str,
        version: &str,
        drm_type: DrmType,
        stream_type: StreamType,
    ) -> Result<Arc<Presentation>, GetPresentationError> {
        let key = format!(
            "{}/{}/{}/{}",
            content_id,
            version,
            drm_type.name(),
            stream_type.name()
        );
        if let Some(presentation) = self.cache.get(&key).await {
            return Ok(presentation);
        }

        let dir = content_dir(&self.archive_dir, content_id, self.dir_levels);
        let playready = self.playready.clone();
        let logger = self.logger.clone();
        let content_id = content_id.to_owned();
        let version = version.to_owned();
        let presentation = tokio::task::spawn_blocking(move || {
            Presentation::load(
                &dir,
                &content_id,
                &version,
                drm_type,
                stream_type,
                &playready,
                &logger,
            )
        })
        .await
        .map_err(|_| GetPresentationError::LoaderGone)??;

        let presentation = Arc::new(presentation);
        self.cache.add(key, presentation.clone()).await;
        Ok(presentation)
    }
}

/// Content directory, optionally sharded by the first
/// characters of the content id.
#[must_use]
pub fn content_dir(archive_dir: &Path, content_id: &str, dir_levels: u8) -> PathBuf {
    let mut dir = archive_dir.to_path_buf();
    for c in content_id.chars().take(usize::from(dir_levels.min(3))) {
        dir.push(c.to_string());
    }
    dir.push(content_id);
    dir
}

#[derive(Debug, Error)]
pub enum AssembleError {
    #[error("open '{0}': {1}")]
    Open(PathBuf, std::io::Error),

    #[error("seek: {0}")]
    Seek(std::io::Error),

    #[error("read: {0}")]
    Read(std::io::Error),
}

/// Gather a fragment's mdat payload from the source file. The
/// result is a complete mdat box: 8-byte header followed by
/// the sample bytes in trun order.
pub fn assemble_fragment(filename: &Path, fragment: &Fragment) -> Result<Vec<u8>, AssembleError> {
    use AssembleError::*;

    let mut file =
        std::fs::File::open(filename).map_err(|e| Open(filename.to_path_buf(), e))?;

    let mdat_size = usize::try_from(fragment.mdat_size).expect("mdat fits memory");
    let mut data = Vec::with_capacity(mdat_size);
    data.extend_from_slice(
        &u32::try_from(fragment.mdat_size)
            .expect("mdat fits u32")
            .to_be_bytes(),
    );
    data.extend_from_slice(b"mdat");

    for chunk in &fragment.chunks {
        file.seek(SeekFrom::Start(chunk.offset)).map_err(Seek)?;
        let start = data.len();
        data.resize(start + usize::try_from(chunk.size).expect("chunk fits memory"), 0);
        file.read_exact(&mut data[start..]).map_err(Read)?;
    }
    Ok(data)
}
