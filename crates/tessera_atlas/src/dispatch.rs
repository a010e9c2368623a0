//! Rasterization dispatch
//!
//! Inline mode rasterizes on the calling thread inside `request_glyph`.
//! Background mode hands jobs to a small worker pool; results come back on a
//! completion channel that the render thread drains at a point of its
//! choosing, so cache state is only ever touched from one thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::entry::EntryId;
use crate::error::{AtlasError, Result};
use crate::key::GlyphKey;
use crate::raster::{GlyphRasterizer, RasterError, RasterizedGlyph};

/// Where rasterization runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// On the calling thread; misses come back `Ready` (or `Uploaded`)
    Inline,
    /// On `workers` background threads; misses come back `Loading`
    Background { workers: usize },
}

impl DispatchMode {
    /// Background mode sized to the machine (at most 4 workers)
    pub fn background() -> Self {
        let workers = thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1))
            .unwrap_or(1)
            .clamp(1, 4);
        DispatchMode::Background { workers }
    }
}

/// One glyph to rasterize
#[derive(Debug, Clone, Copy)]
pub struct RasterJob {
    pub entry: EntryId,
    pub key: GlyphKey,
}

/// Finished rasterization, successful or not
#[derive(Debug)]
pub struct RasterCompletion {
    pub entry: EntryId,
    pub key: GlyphKey,
    pub result: std::result::Result<RasterizedGlyph, RasterError>,
}

type SharedJobs = Arc<Mutex<Receiver<RasterJob>>>;

enum Mode<R> {
    Inline(R),
    Background {
        jobs: Option<Sender<RasterJob>>,
        workers: Vec<JoinHandle<()>>,
        completions: Receiver<RasterCompletion>,
    },
}

/// Routes cache misses to the rasterizer
pub struct RasterDispatcher<R> {
    mode: Mode<R>,
    bytes_per_texel: u32,
    in_flight: usize,
}

impl<R> RasterDispatcher<R>
where
    R: GlyphRasterizer + Clone + 'static,
{
    /// Create a dispatcher. In background mode every worker gets its own
    /// clone of `rasterizer`.
    pub fn new(rasterizer: R, mode: DispatchMode, bytes_per_texel: u32) -> Result<Self> {
        let mode = match mode {
            DispatchMode::Inline => Mode::Inline(rasterizer),
            DispatchMode::Background { workers } => {
                let count = if workers == 0 {
                    tracing::warn!("background dispatch with 0 workers, using 1");
                    1
                } else {
                    workers
                };

                let (job_tx, job_rx) = mpsc::channel::<RasterJob>();
                let (done_tx, done_rx) = mpsc::channel::<RasterCompletion>();
                let job_rx: SharedJobs = Arc::new(Mutex::new(job_rx));

                let mut handles = Vec::with_capacity(count);
                for i in 0..count {
                    let jobs = Arc::clone(&job_rx);
                    let done = done_tx.clone();
                    let rasterizer = rasterizer.clone();
                    let handle = thread::Builder::new()
                        .name(format!("tessera-raster-{}", i))
                        .spawn(move || worker_loop(rasterizer, jobs, done, bytes_per_texel))
                        .map_err(AtlasError::WorkerSpawn)?;
                    handles.push(handle);
                }
                tracing::debug!("started {} rasterization workers", count);

                Mode::Background {
                    jobs: Some(job_tx),
                    workers: handles,
                    completions: done_rx,
                }
            }
        };
        Ok(Self {
            mode,
            bytes_per_texel,
            in_flight: 0,
        })
    }
}

impl<R: GlyphRasterizer> RasterDispatcher<R> {
    /// Submit a job.
    ///
    /// Inline mode returns the completion right away. Background mode
    /// returns `None`; the result shows up in [`Self::try_completion`].
    pub fn dispatch(&mut self, job: RasterJob) -> Option<RasterCompletion> {
        match &mut self.mode {
            Mode::Inline(rasterizer) => Some(run_job(rasterizer, job, self.bytes_per_texel)),
            Mode::Background { jobs, .. } => {
                let sent = jobs.as_ref().map(|tx| tx.send(job).is_ok()).unwrap_or(false);
                if sent {
                    self.in_flight += 1;
                    None
                } else {
                    tracing::error!("rasterization workers are gone, failing {:?}", job.key);
                    Some(RasterCompletion {
                        entry: job.entry,
                        key: job.key,
                        result: Err(RasterError::Engine("rasterization workers stopped".into())),
                    })
                }
            }
        }
    }

    /// Next finished background job, if any. Never blocks.
    pub fn try_completion(&mut self) -> Option<RasterCompletion> {
        let Mode::Background { completions, .. } = &self.mode else {
            return None;
        };
        match completions.try_recv() {
            Ok(completion) => {
                self.in_flight = self.in_flight.saturating_sub(1);
                Some(completion)
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Block until the next background job finishes.
    ///
    /// Returns `None` when nothing is in flight.
    pub fn wait_completion(&mut self) -> Option<RasterCompletion> {
        if self.in_flight == 0 {
            return None;
        }
        let Mode::Background { completions, .. } = &self.mode else {
            return None;
        };
        let completion = completions.recv().ok()?;
        self.in_flight -= 1;
        Some(completion)
    }

    /// Jobs submitted to workers whose completion has not been drained
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn is_background(&self) -> bool {
        matches!(self.mode, Mode::Background { .. })
    }

    /// Stop accepting jobs and join the workers. Queued jobs still run;
    /// their completions are discarded.
    pub fn shutdown(&mut self) {
        if let Mode::Background { jobs, workers, .. } = &mut self.mode {
            jobs.take();
            for handle in workers.drain(..) {
                if handle.join().is_err() {
                    tracing::error!("rasterization worker exited abnormally");
                }
            }
        }
    }
}

impl<R> Drop for RasterDispatcher<R> {
    fn drop(&mut self) {
        if let Mode::Background { jobs, workers, .. } = &mut self.mode {
            jobs.take();
            for handle in workers.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

fn worker_loop<R: GlyphRasterizer>(
    mut rasterizer: R,
    jobs: SharedJobs,
    done: Sender<RasterCompletion>,
    bytes_per_texel: u32,
) {
    loop {
        let next = {
            let rx = match jobs.lock() {
                Ok(rx) => rx,
                Err(poisoned) => poisoned.into_inner(),
            };
            rx.recv()
        };
        let Ok(job) = next else {
            break;
        };
        let completion = run_job(&mut rasterizer, job, bytes_per_texel);
        if done.send(completion).is_err() {
            break;
        }
    }
}

fn run_job<R: GlyphRasterizer>(
    rasterizer: &mut R,
    job: RasterJob,
    bytes_per_texel: u32,
) -> RasterCompletion {
    let result = panic::catch_unwind(AssertUnwindSafe(|| rasterizer.rasterize(&job.key)))
        .unwrap_or_else(|payload| Err(RasterError::Panicked(panic_message(payload.as_ref()))))
        .and_then(|glyph| glyph.check_len(bytes_per_texel).map(|()| glyph));

    if let Err(e) = &result {
        tracing::debug!("rasterization of {:?} failed: {}", job.key, e);
    }

    RasterCompletion {
        entry: job.entry,
        key: job.key,
        result,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn ids(n: usize) -> Vec<EntryId> {
        let mut map: SlotMap<EntryId, ()> = SlotMap::with_key();
        (0..n).map(|_| map.insert(())).collect()
    }

    fn solid(key: &GlyphKey) -> std::result::Result<RasterizedGlyph, RasterError> {
        Ok(RasterizedGlyph::new(2, 2, vec![key.codepoint as u8; 4]))
    }

    #[test]
    fn test_inline_completes_immediately() {
        let mut dispatcher = RasterDispatcher::new(solid, DispatchMode::Inline, 1).unwrap();
        let id = ids(1)[0];
        let key = GlyphKey::new(0, 'x' as u32, 16 << 16);
        let done = dispatcher
            .dispatch(RasterJob { entry: id, key })
            .unwrap();
        assert_eq!(done.entry, id);
        assert_eq!(done.result.unwrap().pixels, vec![b'x'; 4]);
        assert_eq!(dispatcher.in_flight(), 0);
        assert!(dispatcher.try_completion().is_none());
    }

    #[test]
    fn test_background_delivers_all_jobs() {
        let mut dispatcher =
            RasterDispatcher::new(solid, DispatchMode::Background { workers: 3 }, 1).unwrap();
        let entries = ids(32);
        for (i, &entry) in entries.iter().enumerate() {
            let key = GlyphKey::new(0, i as u32, 16 << 16);
            assert!(dispatcher.dispatch(RasterJob { entry, key }).is_none());
        }
        assert_eq!(dispatcher.in_flight(), 32);

        let mut seen = Vec::new();
        while let Some(done) = dispatcher.wait_completion() {
            assert!(done.result.is_ok());
            seen.push(done.entry);
        }
        seen.sort();
        let mut expected = entries.clone();
        expected.sort();
        assert_eq!(seen, expected);
        assert_eq!(dispatcher.in_flight(), 0);
        dispatcher.shutdown();
    }

    #[test]
    fn test_panicking_rasterizer_reports_failure() {
        let boom = |_: &GlyphKey| -> std::result::Result<RasterizedGlyph, RasterError> {
            panic!("bad outline")
        };
        let mut dispatcher =
            RasterDispatcher::new(boom, DispatchMode::Background { workers: 1 }, 1).unwrap();
        let entry = ids(1)[0];
        dispatcher.dispatch(RasterJob {
            entry,
            key: GlyphKey::new(0, 1, 0),
        });
        let done = dispatcher.wait_completion().unwrap();
        assert_eq!(
            done.result,
            Err(RasterError::Panicked("bad outline".to_string()))
        );

        // The worker survives the panic
        dispatcher.dispatch(RasterJob {
            entry,
            key: GlyphKey::new(0, 2, 0),
        });
        assert!(dispatcher.wait_completion().is_some());
    }

    #[test]
    fn test_truncated_bitmap_is_failure() {
        let short = |_: &GlyphKey| -> std::result::Result<RasterizedGlyph, RasterError> {
            Ok(RasterizedGlyph::new(4, 4, vec![0; 8]))
        };
        let mut dispatcher = RasterDispatcher::new(short, DispatchMode::Inline, 1).unwrap();
        let done = dispatcher
            .dispatch(RasterJob {
                entry: ids(1)[0],
                key: GlyphKey::new(0, 1, 0),
            })
            .unwrap();
        assert!(matches!(done.result, Err(RasterError::Truncated { .. })));
    }

    #[test]
    fn test_zero_workers_still_runs() {
        let mut dispatcher =
            RasterDispatcher::new(solid, DispatchMode::Background { workers: 0 }, 1).unwrap();
        dispatcher.dispatch(RasterJob {
            entry: ids(1)[0],
            key: GlyphKey::new(0, 1, 0),
        });
        assert!(dispatcher.wait_completion().is_some());
    }
}
