//! Scripted generation providers.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::pipeline::{ItemGenerator, JobGenerator, JobRequest, JobState, StoryGenerator};

/// A story generator that returns well-formed stories after a scripted
/// number of failures.
///
/// The page count is read from the schema's `minItems`, so the generated
/// story always matches the request unless a short story is scripted.
#[derive(Debug, Default)]
pub struct ScriptedStoryGenerator {
    failures: Mutex<u32>,
    short_stories: Mutex<u32>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedStoryGenerator {
    /// Creates a generator that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the first `times` calls with a provider error.
    #[must_use]
    pub fn failing_times(self, times: u32) -> Self {
        *self.failures.lock() = times;
        self
    }

    /// Fails every call.
    #[must_use]
    pub fn always_failing(self) -> Self {
        self.failing_times(u32::MAX)
    }

    /// Returns a story one page short for the first `times` calls.
    #[must_use]
    pub fn with_short_stories(self, times: u32) -> Self {
        *self.short_stories.lock() = times;
        self
    }

    /// Number of calls so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prompts received, in call order.
    #[must_use]
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    fn take(counter: &Mutex<u32>) -> bool {
        let mut remaining = counter.lock();
        if *remaining == 0 {
            return false;
        }
        if *remaining != u32::MAX {
            *remaining -= 1;
        }
        true
    }
}

#[async_trait]
impl StoryGenerator for ScriptedStoryGenerator {
    async fn generate(&self, prompt: &str, schema: &Value) -> anyhow::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(prompt.to_string());

        if Self::take(&self.failures) {
            anyhow::bail!("story provider unavailable");
        }

        let mut page_count = schema["properties"]["pages"]["minItems"]
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(1);
        if Self::take(&self.short_stories) {
            page_count = page_count.saturating_sub(1);
        }

        let pages: Vec<Value> = (0..page_count)
            .map(|i| {
                json!({
                    "text": format!("Page {i} text"),
                    "image_prompt": format!("Illustration {i}"),
                })
            })
            .collect();
        Ok(json!({"title": "The Scripted Fox", "pages": pages}))
    }
}

#[derive(Debug)]
struct FailureRule {
    pattern: String,
    remaining: u32,
}

/// An item generator that echoes its prompt, failing prompts that match a
/// scripted pattern.
#[derive(Debug)]
pub struct ScriptedItemGenerator {
    content_type: String,
    extension: String,
    rules: Mutex<Vec<FailureRule>>,
    calls: Mutex<Vec<(u64, String)>>,
}

impl ScriptedItemGenerator {
    /// Creates a generator producing `content_type` items.
    #[must_use]
    pub fn new(content_type: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            extension: extension.into(),
            rules: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A PNG image generator.
    #[must_use]
    pub fn images() -> Self {
        Self::new("image/png", "png")
    }

    /// An MP3 narration generator.
    #[must_use]
    pub fn audio() -> Self {
        Self::new("audio/mpeg", "mp3")
    }

    /// Fails the next `times` calls whose prompt contains `pattern`.
    #[must_use]
    pub fn failing_for(self, pattern: impl Into<String>, times: u32) -> Self {
        self.rules.lock().push(FailureRule {
            pattern: pattern.into(),
            remaining: times,
        });
        self
    }

    /// Fails every call whose prompt contains `pattern`.
    #[must_use]
    pub fn always_failing_for(self, pattern: impl Into<String>) -> Self {
        self.failing_for(pattern, u32::MAX)
    }

    /// `(seed, prompt)` of every call, in call order.
    #[must_use]
    pub fn calls(&self) -> Vec<(u64, String)> {
        self.calls.lock().clone()
    }

    /// Number of calls whose prompt contains `pattern`.
    #[must_use]
    pub fn calls_matching(&self, pattern: &str) -> usize {
        self.calls.lock().iter().filter(|(_, p)| p.contains(pattern)).count()
    }
}

#[async_trait]
impl ItemGenerator for ScriptedItemGenerator {
    async fn generate_item(&self, seed: u64, prompt: &str) -> anyhow::Result<Vec<u8>> {
        self.calls.lock().push((seed, prompt.to_string()));

        let mut rules = self.rules.lock();
        if let Some(rule) = rules
            .iter_mut()
            .find(|r| r.remaining > 0 && prompt.contains(&r.pattern))
        {
            if rule.remaining != u32::MAX {
                rule.remaining -= 1;
            }
            anyhow::bail!("generation failed for '{}'", rule.pattern);
        }
        Ok(format!("{seed}:{prompt}").into_bytes())
    }

    fn content_type(&self) -> &str {
        &self.content_type
    }

    fn extension(&self) -> &str {
        &self.extension
    }
}

#[derive(Debug)]
struct ScriptedJob {
    source_url: String,
    polls: u32,
    stuck: bool,
}

/// A job provider whose jobs settle after a scripted number of polls.
#[derive(Debug)]
pub struct ScriptedJobGenerator {
    polls_until_done: u32,
    stuck_once: Mutex<HashSet<String>>,
    failing_sources: HashSet<String>,
    jobs: Mutex<HashMap<String, ScriptedJob>>,
    submitted: Mutex<Vec<JobRequest>>,
    next_id: AtomicUsize,
}

impl Default for ScriptedJobGenerator {
    fn default() -> Self {
        Self {
            polls_until_done: 1,
            stuck_once: Mutex::new(HashSet::new()),
            failing_sources: HashSet::new(),
            jobs: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl ScriptedJobGenerator {
    /// Jobs complete on their second status check.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `processing` answers before a job completes.
    #[must_use]
    pub fn with_polls_until_done(mut self, polls: u32) -> Self {
        self.polls_until_done = polls;
        self
    }

    /// The first job submitted for `source_url` never settles.
    #[must_use]
    pub fn with_stuck_first_submission(self, source_url: impl Into<String>) -> Self {
        self.stuck_once.lock().insert(source_url.into());
        self
    }

    /// Every job for `source_url` fails with `render error`.
    #[must_use]
    pub fn with_failing_source(mut self, source_url: impl Into<String>) -> Self {
        self.failing_sources.insert(source_url.into());
        self
    }

    /// Every request submitted so far.
    #[must_use]
    pub fn submitted(&self) -> Vec<JobRequest> {
        self.submitted.lock().clone()
    }
}

#[async_trait]
impl JobGenerator for ScriptedJobGenerator {
    async fn submit(&self, request: &JobRequest) -> anyhow::Result<String> {
        let id = format!("job-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let stuck = self.stuck_once.lock().remove(&request.source_url);
        self.submitted.lock().push(request.clone());
        self.jobs.lock().insert(
            id.clone(),
            ScriptedJob {
                source_url: request.source_url.clone(),
                polls: 0,
                stuck,
            },
        );
        Ok(id)
    }

    async fn check_status(&self, job_id: &str) -> anyhow::Result<JobState> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| anyhow::anyhow!("unknown job {job_id}"))?;

        if self.failing_sources.contains(&job.source_url) {
            return Ok(JobState::Failed {
                reason: "render error".to_string(),
            });
        }
        if job.stuck || job.polls < self.polls_until_done {
            job.polls = job.polls.saturating_add(1);
            return Ok(JobState::Processing);
        }
        Ok(JobState::Completed)
    }

    async fn fetch(&self, job_id: &str) -> anyhow::Result<Vec<u8>> {
        let jobs = self.jobs.lock();
        let job = jobs
            .get(job_id)
            .ok_or_else(|| anyhow::anyhow!("unknown job {job_id}"))?;
        Ok(format!("video of {}", job.source_url).into_bytes())
    }
}
