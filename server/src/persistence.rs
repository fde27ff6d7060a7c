use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;
use versedash_protocol::RaceResult;

use crate::auth::AuthUser;

const RACES_FILE: &str = "races.jsonl";
const DAILY_FILE: &str = "daily_scores.jsonl";
const RECORD_RETRIES: u32 = 3;

/// One finished race, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaceRecord {
    pub lobby_id: Uuid,
    pub reference: String,
    pub finished_at: DateTime<Utc>,
    pub results: Vec<RaceResult>,
}

/// One daily-challenge submission, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyScore {
    pub user_id: Uuid,
    pub username: String,
    pub date: NaiveDate,
    pub wpm: u32,
    pub accuracy: u32,
    pub time_seconds: f64,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlltimeScore {
    pub user_id: Uuid,
    pub username: String,
    pub best_wpm: u32,
    pub races: u64,
}

/// Leaderboard/storage collaborator. Records are appended to JSONL files
/// under the data directory; in-memory indexes serve the leaderboard reads
/// and are rebuilt from the files on startup. Invalid lines are skipped.
pub struct ResultsStore {
    data_dir: PathBuf,
    daily: Mutex<HashMap<NaiveDate, HashMap<Uuid, DailyScore>>>,
    alltime: Mutex<HashMap<Uuid, AlltimeScore>>,
}

impl ResultsStore {
    pub async fn open(data_dir: impl AsRef<Path>) -> io::Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir).await?;
        let store = Self {
            data_dir,
            daily: Mutex::new(HashMap::new()),
            alltime: Mutex::new(HashMap::new()),
        };
        store.replay().await?;
        Ok(store)
    }

    async fn replay(&self) -> io::Result<()> {
        for line in read_lines(self.data_dir.join(DAILY_FILE)).await? {
            if let Ok(score) = serde_json::from_str::<DailyScore>(&line) {
                self.fold_daily(score);
            }
        }
        for line in read_lines(self.data_dir.join(RACES_FILE)).await? {
            if let Ok(record) = serde_json::from_str::<RaceRecord>(&line) {
                self.fold_race(&record);
            }
        }
        Ok(())
    }

    async fn append(&self, file: &str, line: &str) -> io::Result<()> {
        let path = self.data_dir.join(file);
        let mut f = fs::OpenOptions::new().create(true).append(true).open(path).await?;
        f.write_all(line.as_bytes()).await?;
        f.write_all(b"\n").await?;
        Ok(())
    }

    /// Persists the final standings of one race.
    pub async fn record_race_results(
        &self,
        lobby_id: Uuid,
        reference: &str,
        results: &[RaceResult],
    ) -> io::Result<()> {
        let record = RaceRecord {
            lobby_id,
            reference: reference.to_string(),
            finished_at: Utc::now(),
            results: results.to_vec(),
        };
        let line = serde_json::to_string(&record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.append(RACES_FILE, &line).await?;
        self.fold_race(&record);
        Ok(())
    }

    /// Fire-and-forget persistence for the result resolver: the `race_end`
    /// broadcast has already gone out by the time this runs, so failures are
    /// retried a few times and then only logged.
    pub async fn record_race_results_with_retry(
        &self,
        lobby_id: Uuid,
        reference: &str,
        results: &[RaceResult],
    ) {
        for attempt in 1..=RECORD_RETRIES {
            match self.record_race_results(lobby_id, reference, results).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(
                        "[RESULTS] lobby={lobby_id} attempt {attempt}/{RECORD_RETRIES} failed: {e}"
                    );
                    tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
                }
            }
        }
        tracing::warn!("[RESULTS] lobby={lobby_id} giving up; race state unaffected");
    }

    /// Records a daily-challenge score; returns the submitter's rank for the
    /// day and how many players have a score on the board.
    pub async fn record_daily_score(
        &self,
        user: &AuthUser,
        wpm: u32,
        accuracy: u32,
        time_seconds: f64,
    ) -> io::Result<(usize, usize)> {
        let score = DailyScore {
            user_id: user.user_id,
            username: user.username.clone(),
            date: Utc::now().date_naive(),
            wpm,
            accuracy,
            time_seconds,
            submitted_at: Utc::now(),
        };
        let line = serde_json::to_string(&score)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.append(DAILY_FILE, &line).await?;
        Ok(self.fold_daily(score))
    }

    fn fold_daily(&self, score: DailyScore) -> (usize, usize) {
        let date = score.date;
        let user_id = score.user_id;
        let mut daily = self.daily.lock();
        let day = daily.entry(date).or_default();

        // only a player's best run of the day stays on the board
        let entry = day.entry(user_id).or_insert_with(|| score.clone());
        if score.wpm >= entry.wpm {
            *entry = score.clone();
        }
        let best = entry.wpm;
        let rank = 1 + day.values().filter(|s| s.user_id != user_id && s.wpm > best).count();
        let total = day.len();
        drop(daily);

        let mut alltime = self.alltime.lock();
        let e = alltime.entry(user_id).or_insert_with(|| AlltimeScore {
            user_id,
            username: score.username.clone(),
            best_wpm: 0,
            races: 0,
        });
        e.best_wpm = e.best_wpm.max(score.wpm);
        e.username = score.username;

        (rank, total)
    }

    fn fold_race(&self, record: &RaceRecord) {
        let mut alltime = self.alltime.lock();
        for res in &record.results {
            let e = alltime.entry(res.user_id).or_insert_with(|| AlltimeScore {
                user_id: res.user_id,
                username: res.username.clone(),
                best_wpm: 0,
                races: 0,
            });
            e.races += 1;
            // timeout stragglers carry no observed pace
            if res.time.is_some() {
                e.best_wpm = e.best_wpm.max(res.wpm);
            }
            e.username = res.username.clone();
        }
    }

    pub fn daily_scores(&self, date: NaiveDate) -> Vec<DailyScore> {
        let daily = self.daily.lock();
        let mut scores: Vec<DailyScore> =
            daily.get(&date).map(|day| day.values().cloned().collect()).unwrap_or_default();
        scores.sort_by(|a, b| b.wpm.cmp(&a.wpm).then_with(|| a.submitted_at.cmp(&b.submitted_at)));
        scores
    }

    pub fn alltime_scores(&self, limit: usize) -> Vec<AlltimeScore> {
        let alltime = self.alltime.lock();
        let mut scores: Vec<AlltimeScore> = alltime.values().cloned().collect();
        scores.sort_by(|a, b| b.best_wpm.cmp(&a.best_wpm).then_with(|| b.races.cmp(&a.races)));
        scores.truncate(limit);
        scores
    }

    pub fn best_wpm(&self, user_id: Uuid) -> Option<u32> {
        self.alltime.lock().get(&user_id).map(|s| s.best_wpm)
    }
}

async fn read_lines(path: PathBuf) -> io::Result<Vec<String>> {
    match fs::read_to_string(&path).await {
        Ok(content) => Ok(content.lines().map(str::to_string).collect()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}
