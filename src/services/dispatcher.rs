//! Bounded worker pool in front of the upload [`Pipeline`].
//!
//! Jobs go through an intake channel of capacity one. A fixed set of workers
//! share the receiving end; each pulls one job at a time and answers on the
//! job's private reply channel. When every worker is busy, submitters wait
//! for a free one.

use crate::errors::UploadError;
use crate::models::{file::FileRecord, smile::{NewSmile, SmileRecord}, token::ClaimToken};
use crate::services::pipeline::{ByteSource, JobKind, JobResult, Pipeline, Uploaded};
use anyhow::anyhow;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info};

struct UploadJob {
    actor: String,
    source: ByteSource,
    max_bytes: u64,
    kind: JobKind,
    reply: oneshot::Sender<JobResult>,
}

#[derive(Clone, Copy, Debug)]
pub struct UploadLimits {
    pub max_file_bytes: u64,
    pub max_smile_bytes: u64,
}

#[derive(Clone)]
pub struct Dispatcher {
    jobs: mpsc::Sender<UploadJob>,
    limits: UploadLimits,
}

impl Dispatcher {
    /// Spawn `workers` workers (at least one) on the current runtime.
    pub fn start(workers: usize, limits: UploadLimits, pipeline: Arc<Pipeline>) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let rx = Arc::new(Mutex::new(rx));
        let workers = workers.max(1);
        for id in 0..workers {
            tokio::spawn(worker(id, Arc::clone(&rx), Arc::clone(&pipeline)));
        }
        info!(workers, "upload workers started");
        Self { jobs: tx, limits }
    }

    /// Submit a regular upload and wait for its record and claim token.
    ///
    /// `declared_size` is checked before the job is queued.
    pub async fn submit_file(
        &self,
        actor: impl Into<String>,
        source: ByteSource,
        declared_size: u64,
    ) -> Result<(FileRecord, ClaimToken), UploadError> {
        let max_bytes = self.limits.max_file_bytes;
        if declared_size > max_bytes {
            return Err(UploadError::TooLarge);
        }
        match self.submit(actor.into(), source, max_bytes, JobKind::File).await? {
            Uploaded::File { file, token } => Ok((file, token)),
            Uploaded::Smile(_) => Err(UploadError::hide(anyhow!("file job answered with a smile"))),
        }
    }

    /// Submit a smile sprite for `smile.board`.
    pub async fn submit_smile(
        &self,
        actor: impl Into<String>,
        source: ByteSource,
        declared_size: u64,
        smile: NewSmile,
    ) -> Result<SmileRecord, UploadError> {
        let max_bytes = self.limits.max_smile_bytes;
        if declared_size > max_bytes {
            return Err(UploadError::TooLarge);
        }
        match self
            .submit(actor.into(), source, max_bytes, JobKind::Smile(smile))
            .await?
        {
            Uploaded::Smile(record) => Ok(record),
            Uploaded::File { .. } => Err(UploadError::hide(anyhow!("smile job answered with a file"))),
        }
    }

    async fn submit(
        &self,
        actor: String,
        source: ByteSource,
        max_bytes: u64,
        kind: JobKind,
    ) -> JobResult {
        let (reply, answer) = oneshot::channel();
        let job = UploadJob {
            actor,
            source,
            max_bytes,
            kind,
            reply,
        };
        self.jobs
            .send(job)
            .await
            .map_err(|_| UploadError::hide(anyhow!("upload queue closed")))?;
        answer
            .await
            .map_err(|_| UploadError::hide(anyhow!("upload worker dropped the job")))?
    }
}

async fn worker(id: usize, jobs: Arc<Mutex<mpsc::Receiver<UploadJob>>>, pipeline: Arc<Pipeline>) {
    debug!(worker = id, "upload worker ready");
    loop {
        // Hold the lock only while waiting for the next job.
        let job = jobs.lock().await.recv().await;
        let Some(job) = job else {
            break;
        };

        let result = pipeline
            .process(&job.actor, job.source, job.max_bytes, job.kind)
            .await;
        // The submitter may have gone away; its answer is dropped then.
        let _ = job.reply.send(result);
    }
    debug!(worker = id, "upload queue closed, worker exiting");
}
