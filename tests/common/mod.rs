//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`], which wires a full [`Orchestrator`] to a
//! file-backed database in a temp directory and to [`FakeTools`], a
//! scripted stand-in for ffmpeg, ffprobe and mp4hls. Fake encoder runs
//! write the input path they were given into their output file, and fake
//! concatenation joins its inputs, so tests can check which segments ended
//! up in a rendition and in what order.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use reelforge::config::Config;
use reelforge::dispatcher::LocalDispatcher;
use reelforge::events::EventBus;
use reelforge::media_tools::{EncoderRun, MediaTools};
use reelforge::worker::WorkerPool;
use reelforge::{ImportRequest, Orchestrator};
use reelforge_av::actions::MANIFEST_NAME;
use reelforge_av::{EncoderCommand, Progress, RunError, RunLog, Workspace};
use reelforge_common::{Codec, EncodingId, MediaId, MediaInfo, TimeRange};
use reelforge_db::models::{EncodeProfile, Encoding, Media, TrimRequest};
use reelforge_db::queries::{encodings, media, profiles, trim_requests};
use reelforge_db::{get_conn, init_pool, DbPool, PooledConnection};

// ---------------------------------------------------------------------------
// Fake media tools
// ---------------------------------------------------------------------------

/// What a fake encoder run does.
#[derive(Debug, Clone, PartialEq)]
pub enum Script {
    Succeed,
    /// Exit non-zero with this diagnostic text.
    Fail(String),
    /// Never finish; only a kill ends it.
    Block,
}

struct Rule {
    needle: String,
    script: Script,
    /// `None` applies forever.
    remaining: Option<usize>,
}

#[derive(Default)]
struct FakeState {
    probes: HashMap<String, MediaInfo>,
    rules: Vec<Rule>,
    commands: Vec<EncoderCommand>,
    concats: Vec<Vec<PathBuf>>,
    cuts: Vec<(PathBuf, Vec<TimeRange>)>,
    packages: Vec<Vec<PathBuf>>,
    blocked: usize,
    kills: usize,
    fail_segment: bool,
    fail_concat: bool,
    fail_cut: bool,
    no_packager: bool,
    before_concat: Option<Arc<dyn Fn() + Send + Sync>>,
}

/// Scripted [`MediaTools`].
#[derive(Clone, Default)]
pub struct FakeTools {
    state: Arc<Mutex<FakeState>>,
}

impl FakeTools {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register what probing a file with this name returns.
    pub fn set_probe(&self, file_name: &str, info: MediaInfo) {
        self.state.lock().probes.insert(file_name.to_string(), info);
    }

    /// Apply `script` to every encoder command whose rendering contains
    /// `needle`.
    pub fn script(&self, needle: &str, script: Script) {
        self.push_rule(needle, script, None);
    }

    /// Apply `script` to the next `times` matching commands only.
    pub fn script_times(&self, needle: &str, script: Script, times: usize) {
        self.push_rule(needle, script, Some(times));
    }

    fn push_rule(&self, needle: &str, script: Script, remaining: Option<usize>) {
        self.state.lock().rules.push(Rule {
            needle: needle.to_string(),
            script,
            remaining,
        });
    }

    pub fn fail_segment(&self) {
        self.state.lock().fail_segment = true;
    }

    pub fn fail_concat(&self) {
        self.state.lock().fail_concat = true;
    }

    /// Run `hook` at the start of every concatenation.
    pub fn before_concat(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.state.lock().before_concat = Some(Arc::new(hook));
    }

    pub fn fail_cut(&self) {
        self.state.lock().fail_cut = true;
    }

    pub fn remove_packager(&self) {
        self.state.lock().no_packager = true;
    }

    pub fn commands(&self) -> Vec<EncoderCommand> {
        self.state.lock().commands.clone()
    }

    pub fn concats(&self) -> Vec<Vec<PathBuf>> {
        self.state.lock().concats.clone()
    }

    pub fn cuts(&self) -> Vec<(PathBuf, Vec<TimeRange>)> {
        self.state.lock().cuts.clone()
    }

    pub fn packages(&self) -> Vec<Vec<PathBuf>> {
        self.state.lock().packages.clone()
    }

    /// Blocking runs started so far.
    pub fn blocked(&self) -> usize {
        self.state.lock().blocked
    }

    pub fn kills(&self) -> usize {
        self.state.lock().kills
    }

    fn pick_script(&self, rendered: &str) -> Script {
        let mut state = self.state.lock();
        for rule in state.rules.iter_mut() {
            if rule.remaining == Some(0) || !rendered.contains(&rule.needle) {
                continue;
            }
            if let Some(n) = rule.remaining.as_mut() {
                *n -= 1;
            }
            return rule.script.clone();
        }
        Script::Succeed
    }
}

fn io_err(e: std::io::Error) -> reelforge_av::Error {
    reelforge_av::Error::Io(e)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[async_trait]
impl MediaTools for FakeTools {
    fn ffmpeg(&self) -> reelforge_av::Result<PathBuf> {
        Ok(PathBuf::from("/usr/bin/ffmpeg"))
    }

    fn packager_available(&self) -> bool {
        !self.state.lock().no_packager
    }

    async fn probe(&self, path: &Path) -> reelforge_av::Result<MediaInfo> {
        let mut info = self
            .state
            .lock()
            .probes
            .get(&file_name(path))
            .cloned()
            .ok_or_else(|| reelforge_av::Error::parse_error("ffprobe", "unknown fake file"))?;

        // Files written by a fake cut start with their kept duration.
        let content = std::fs::read_to_string(path).map_err(io_err)?;
        if let Some(secs) = content
            .lines()
            .next()
            .and_then(|l| l.strip_prefix("trimmed "))
            .and_then(|s| s.parse::<f64>().ok())
        {
            info.duration_secs = secs;
        }
        Ok(info)
    }

    fn spawn_encoder(&self, cmd: &EncoderCommand) -> Result<Box<dyn EncoderRun>, RunError> {
        let script = self.pick_script(&cmd.display());
        {
            let mut state = self.state.lock();
            state.commands.push(cmd.clone());
            if script == Script::Block {
                state.blocked += 1;
            }
        }
        Ok(Box::new(FakeRun {
            cmd: cmd.clone(),
            script,
            progress: VecDeque::from([
                Progress { elapsed_secs: 1.0 },
                Progress { elapsed_secs: 2.0 },
            ]),
            state: Arc::clone(&self.state),
        }))
    }

    async fn segment(
        &self,
        input: &Path,
        out_dir: &Path,
        segment_secs: u64,
        _timeout: Duration,
    ) -> reelforge_av::Result<Vec<PathBuf>> {
        if self.state.lock().fail_segment {
            return Err(reelforge_av::Error::tool_failed("ffmpeg", "segmenting failed"));
        }
        let duration = self.probe(input).await?.duration_secs;
        let count = ((duration / segment_secs as f64).ceil() as usize).max(1);

        std::fs::create_dir_all(out_dir).map_err(io_err)?;
        let mut segments = Vec::with_capacity(count);
        for i in 0..count {
            let path = out_dir.join(format!("{i:05}.mp4"));
            std::fs::write(&path, format!("segment {i}\n")).map_err(io_err)?;
            segments.push(path);
        }
        Ok(segments)
    }

    async fn concat(
        &self,
        inputs: &[PathBuf],
        _list_path: &Path,
        output: &Path,
        _timeout: Duration,
    ) -> reelforge_av::Result<()> {
        let (fail, hook) = {
            let mut state = self.state.lock();
            state.concats.push(inputs.to_vec());
            (state.fail_concat, state.before_concat.clone())
        };
        if let Some(hook) = hook {
            hook();
        }
        if fail {
            return Err(reelforge_av::Error::tool_failed("ffmpeg", "concat failed"));
        }
        let mut joined = String::new();
        for input in inputs {
            joined.push_str(&std::fs::read_to_string(input).map_err(io_err)?);
        }
        std::fs::write(output, joined).map_err(io_err)
    }

    async fn cut(
        &self,
        input: &Path,
        ranges: &[TimeRange],
        output: &Path,
        _scratch: &Workspace,
        _timeout: Duration,
    ) -> reelforge_av::Result<()> {
        let fail = {
            let mut state = self.state.lock();
            state.cuts.push((input.to_path_buf(), ranges.to_vec()));
            state.fail_cut
        };
        if fail {
            return Err(reelforge_av::Error::tool_failed("ffmpeg", "cut failed"));
        }
        let kept: f64 = ranges.iter().map(TimeRange::duration).sum();
        let original = std::fs::read_to_string(input).map_err(io_err)?;
        std::fs::write(output, format!("trimmed {kept}\n{original}")).map_err(io_err)
    }

    async fn package(
        &self,
        inputs: &[PathBuf],
        output_dir: &Path,
        _segment_duration: u32,
        _timeout: Duration,
    ) -> reelforge_av::Result<PathBuf> {
        self.state.lock().packages.push(inputs.to_vec());
        std::fs::create_dir_all(output_dir).map_err(io_err)?;
        let mut manifest = String::from("#EXTM3U\n");
        for (i, input) in inputs.iter().enumerate() {
            let variant = output_dir.join(format!("v{i}"));
            std::fs::create_dir_all(&variant).map_err(io_err)?;
            std::fs::write(variant.join("stream.m3u8"), file_name(input)).map_err(io_err)?;
            manifest.push_str(&format!("v{i}/stream.m3u8\n"));
        }
        let path = output_dir.join(MANIFEST_NAME);
        std::fs::write(&path, manifest).map_err(io_err)?;
        Ok(path)
    }
}

struct FakeRun {
    cmd: EncoderCommand,
    script: Script,
    progress: VecDeque<Progress>,
    state: Arc<Mutex<FakeState>>,
}

impl FakeRun {
    /// Value following `-i`.
    fn input(&self) -> String {
        self.cmd
            .args
            .iter()
            .skip_while(|a| a.as_str() != "-i")
            .nth(1)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl EncoderRun for FakeRun {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn next_progress(&mut self) -> Result<Option<Progress>, RunError> {
        if self.script == Script::Block {
            std::future::pending::<()>().await;
        }
        Ok(self.progress.pop_front())
    }

    async fn finish(self: Box<Self>) -> Result<RunLog, RunError> {
        match &self.script {
            Script::Succeed => {
                if self.cmd.writes_output {
                    if let Some(output) = self.cmd.args.last() {
                        std::fs::write(output, format!("{}\n", self.input()))?;
                    }
                }
                Ok(RunLog {
                    tail: "frame=  100 fps=50 time=00:00:02.00 speed=1x".to_string(),
                })
            }
            Script::Fail(detail) => Err(RunError::Failed {
                code: Some(1),
                detail: detail.clone(),
            }),
            Script::Block => std::future::pending().await,
        }
    }

    async fn kill(&mut self) {
        self.state.lock().kills += 1;
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Orchestrator over a temp directory, a real database and [`FakeTools`].
pub struct TestHarness {
    pub dir: TempDir,
    pub db: DbPool,
    pub config: Arc<Config>,
    pub tools: Arc<FakeTools>,
    pub queue: Arc<LocalDispatcher>,
    pub events: Arc<EventBus>,
    pub orchestrator: Arc<Orchestrator>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Build a harness after letting `tweak` adjust the default config.
    /// Storage paths always point into the harness temp directory.
    pub fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let mut config = Config::default();
        config.storage.media_root = dir.path().join("media");
        config.storage.temp_dir = dir.path().join("tmp");
        config.storage.hls_dir = dir.path().join("hls");
        config.storage.db_path = dir.path().join("reelforge.db");
        config.workers.poll_interval_ms = 50;
        tweak(&mut config);

        let db = init_pool(&config.storage.db_path).expect("failed to open database");
        let config = Arc::new(config);
        let tools = Arc::new(FakeTools::new());
        let queue = Arc::new(LocalDispatcher::new());
        let events = Arc::new(EventBus::default());

        let orchestrator = Arc::new(Orchestrator::new(
            db.clone(),
            Arc::clone(&config),
            tools.clone(),
            queue.clone(),
            events.clone(),
        ));

        Self {
            dir,
            db,
            config,
            tools,
            queue,
            events,
            orchestrator,
        }
    }

    /// Get a database connection from the pool.
    pub fn conn(&self) -> PooledConnection {
        get_conn(&self.db).expect("failed to get db connection")
    }

    pub fn profile(&self, codec: Codec, resolution: u32) -> EncodeProfile {
        profiles::insert_profile(&self.conn(), codec, resolution).expect("failed to insert profile")
    }

    /// Write a source file, teach the fake prober about it and import it.
    pub async fn import(&self, name: &str, duration_secs: f64, height: u32) -> Media {
        let incoming = self.dir.path().join("incoming");
        std::fs::create_dir_all(&incoming).unwrap();
        let path = incoming.join(name);
        std::fs::write(&path, format!("source {name}\n")).unwrap();

        self.tools.set_probe(
            name,
            MediaInfo {
                duration_secs,
                frame_rate: 30.0,
                width: height * 16 / 9,
                height,
                has_audio: true,
                ..Default::default()
            },
        );

        self.orchestrator
            .import_media(ImportRequest {
                source: path,
                owner: "alice".to_string(),
                uid: None,
                title: None,
            })
            .await
            .expect("import failed")
    }

    pub fn workers(&self, concurrency: usize) -> WorkerPool {
        WorkerPool::new(
            Arc::clone(&self.orchestrator),
            Arc::clone(&self.queue),
            concurrency,
        )
    }

    /// Run every queued job in this task.
    pub async fn drain(&self) -> usize {
        self.workers(1).drain().await
    }

    pub fn media(&self, id: MediaId) -> Media {
        media::require_media(&self.conn(), id).expect("media missing")
    }

    pub fn encodings(&self, media_id: MediaId) -> Vec<Encoding> {
        encodings::list_for_media(&self.conn(), media_id).unwrap()
    }

    pub fn encoding(&self, id: EncodingId) -> Option<Encoding> {
        encodings::get_encoding(&self.conn(), id).unwrap()
    }

    pub fn trim_children(&self, parent: &TrimRequest) -> Vec<TrimRequest> {
        trim_requests::list_children(&self.conn(), parent.id).unwrap()
    }

    /// Poll until `cond` holds, panicking after a few seconds.
    pub async fn wait_for(&self, what: &str, cond: impl Fn(&Self) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !cond(self) {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Contents of a rendition file, one line per source segment it came from.
pub fn read_lines(path: &str) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("failed to read {path}: {e}"))
        .lines()
        .map(str::to_string)
        .collect()
}
