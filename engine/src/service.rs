//! The external session service the engine talks to, and an in-memory
//! implementation of it.
//!
//! Every call is asynchronous; the session loop runs them on spawned tasks
//! and feeds the results back as completions.

use crate::catalog::Catalog;
use crate::error::{FirmamentError, Result};
use firmament_shared::config::LobbyRules;
use firmament_shared::protocol::{
    AnswerWire, CreateLobbyResponse, FamilyProgress, JoinLobbyResponse, LeaderboardEntry,
    LobbyQuestion, LobbyStatus, LobbyStatusResponse, ProfileResponse,
};
use firmament_shared::vec3;
use rand::distributions::Alphanumeric;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashMap};
use std::f64::consts::PI;
use std::future::{ready, Future, Ready};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const LOBBY_ID_LEN: usize = 8;

/// Collaborator operations consumed by a session.
pub trait SessionService: Clone + Send + Sync + 'static {
    fn fetch_profile(&self) -> impl Future<Output = Result<ProfileResponse>> + Send;

    fn post_progress(
        &self,
        family: String,
        progress: u32,
    ) -> impl Future<Output = Result<()>> + Send;

    fn create_lobby(&self) -> impl Future<Output = Result<CreateLobbyResponse>> + Send;

    fn join_lobby(&self, lobby_id: String)
        -> impl Future<Output = Result<JoinLobbyResponse>> + Send;

    fn lobby_status(
        &self,
        lobby_id: String,
    ) -> impl Future<Output = Result<LobbyStatusResponse>> + Send;

    fn start_lobby(&self, lobby_id: String) -> impl Future<Output = Result<()>> + Send;

    fn finish_lobby(
        &self,
        lobby_id: String,
        answers: Vec<AnswerWire>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn submit_score(&self, score: u32) -> impl Future<Output = Result<()>> + Send;

    fn fetch_leaderboard(&self) -> impl Future<Output = Result<Vec<LeaderboardEntry>>> + Send;
}

/// Score for one participant's lobby answers.
///
/// Each answer earns `ceil((PI - angular error) * multiplier)`. An answer
/// that hits the target exactly earns nothing, and submitting more answers
/// than there are questions voids the whole submission.
pub fn lobby_score(questions: &[LobbyQuestion], answers: &[AnswerWire], multiplier: f64) -> i64 {
    if answers.len() > questions.len() {
        return 0;
    }
    questions
        .iter()
        .zip(answers)
        .map(|(q, a)| {
            if q.ra == a.ra && q.dec == a.dec {
                return 0;
            }
            let distance = vec3::angular_distance(
                vec3::from_angles(q.ra, q.dec),
                vec3::from_angles(a.ra, a.dec),
            );
            ((PI - distance) * multiplier).ceil() as i64
        })
        .sum()
}

struct LobbyRecord {
    host: String,
    status: LobbyStatus,
    scores: BTreeMap<String, i64>,
    questions: Vec<LobbyQuestion>,
}

impl LobbyRecord {
    fn status(&self) -> LobbyStatusResponse {
        LobbyStatusResponse {
            status: self.status,
            scores: self.scores.clone(),
        }
    }
}

struct Backend {
    rules: LobbyRules,
    questions: Vec<LobbyQuestion>,
    /// family name -> constellation total
    families: Vec<(String, u32)>,
    lobbies: HashMap<String, LobbyRecord>,
    /// user -> family -> completed
    progress: HashMap<String, HashMap<String, u32>>,
    leaderboard: Vec<LeaderboardEntry>,
    rng: ChaCha8Rng,
    fail_status: u32,
    fail_finish: u32,
}

impl Backend {
    fn lobby_mut(&mut self, lobby_id: &str) -> Result<&mut LobbyRecord> {
        self.lobbies
            .get_mut(lobby_id)
            .ok_or_else(|| FirmamentError::LobbyNotFound(lobby_id.to_string()))
    }

    fn profile(&self, user: &str) -> ProfileResponse {
        let recorded = self.progress.get(user);
        ProfileResponse {
            logged_in: true,
            first_name: Some(user.to_string()),
            last_name: None,
            progress: self
                .families
                .iter()
                .map(|(name, total)| FamilyProgress {
                    name: name.clone(),
                    completed: recorded.and_then(|p| p.get(name)).copied().unwrap_or(0),
                    total: *total,
                })
                .collect(),
        }
    }

    fn set_progress(&mut self, user: &str, family: &str, value: u32) -> Result<()> {
        let (name, total) = self
            .families
            .iter()
            .find(|(name, _)| name == family)
            .ok_or_else(|| FirmamentError::Rejected(format!("unknown family {}", family)))?;
        if value > *total {
            return Err(FirmamentError::Rejected(format!(
                "progress {} exceeds {} for {}",
                value, total, name
            )));
        }
        self.progress
            .entry(user.to_string())
            .or_default()
            .insert(name.clone(), value);
        Ok(())
    }

    fn create_lobby(&mut self, user: &str) -> Result<CreateLobbyResponse> {
        if self.questions.is_empty() {
            return Err(FirmamentError::Rejected("no constellations available".into()));
        }
        let id: String = (&mut self.rng)
            .sample_iter(&Alphanumeric)
            .take(LOBBY_ID_LEN)
            .map(char::from)
            .collect();
        let mut questions = Vec::with_capacity(self.rules.questions_per_lobby);
        for _ in 0..self.rules.questions_per_lobby {
            if let Some(q) = self.questions.choose(&mut self.rng) {
                questions.push(q.clone());
            }
        }
        let mut scores = BTreeMap::new();
        scores.insert(user.to_string(), -1);
        self.lobbies.insert(
            id.clone(),
            LobbyRecord {
                host: user.to_string(),
                status: LobbyStatus::Ready,
                scores,
                questions: questions.clone(),
            },
        );
        Ok(CreateLobbyResponse { id, questions })
    }

    fn join_lobby(&mut self, user: &str, lobby_id: &str) -> Result<JoinLobbyResponse> {
        let max_players = self.rules.max_players;
        let lobby = self.lobby_mut(lobby_id)?;
        if lobby.scores.contains_key(user) {
            return Ok(JoinLobbyResponse {
                questions: lobby.questions.clone(),
            });
        }
        if lobby.scores.len() >= max_players {
            return Err(FirmamentError::Rejected("lobby is full".into()));
        }
        if lobby.status != LobbyStatus::Ready {
            return Err(FirmamentError::Rejected("lobby has already started".into()));
        }
        lobby.scores.insert(user.to_string(), -1);
        Ok(JoinLobbyResponse {
            questions: lobby.questions.clone(),
        })
    }

    fn lobby_status(&mut self, lobby_id: &str) -> Result<LobbyStatusResponse> {
        if self.fail_status > 0 {
            self.fail_status -= 1;
            return Err(FirmamentError::TransientNetworkFailure(
                "status request timed out".into(),
            ));
        }
        self.lobby_mut(lobby_id).map(|lobby| lobby.status())
    }

    fn start_lobby(&mut self, user: &str, lobby_id: &str) -> Result<()> {
        let lobby = self.lobby_mut(lobby_id)?;
        if lobby.status != LobbyStatus::Ready {
            return Err(FirmamentError::Rejected("lobby has already started".into()));
        }
        if lobby.host != user {
            return Err(FirmamentError::Rejected(
                "only the host can start the lobby".into(),
            ));
        }
        lobby.status = LobbyStatus::Started;
        Ok(())
    }

    fn finish_lobby(&mut self, user: &str, lobby_id: &str, answers: &[AnswerWire]) -> Result<()> {
        if self.fail_finish > 0 {
            self.fail_finish -= 1;
            return Err(FirmamentError::TransientNetworkFailure(
                "finish request timed out".into(),
            ));
        }
        let multiplier = self.rules.score_multiplier;
        let lobby = self.lobby_mut(lobby_id)?;
        if lobby.status != LobbyStatus::Started {
            return Err(FirmamentError::Rejected("lobby has not started yet".into()));
        }
        if !lobby.scores.contains_key(user) {
            return Err(FirmamentError::Rejected(
                "you are not a member of this lobby".into(),
            ));
        }
        let score = lobby_score(&lobby.questions, answers, multiplier);
        lobby.scores.insert(user.to_string(), score);
        if lobby.scores.values().all(|s| *s >= 0) {
            lobby.status = LobbyStatus::Ended;
        }
        Ok(())
    }

    fn submit_score(&mut self, user: &str, score: u32) -> Result<()> {
        if score == 0 || score > self.rules.max_challenge_score {
            return Err(FirmamentError::Rejected(format!("invalid score {}", score)));
        }
        match self.leaderboard.iter_mut().find(|e| e.name == user) {
            Some(entry) => entry.score = score,
            None => self.leaderboard.push(LeaderboardEntry {
                name: user.to_string(),
                score,
            }),
        }
        self.leaderboard
            .sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.name.cmp(&b.name)));
        self.leaderboard.truncate(self.rules.leaderboard_size);
        Ok(())
    }
}

/// Shared backend for any number of participants.
#[derive(Clone)]
pub struct InMemoryService {
    backend: Arc<Mutex<Backend>>,
}

impl InMemoryService {
    pub fn new(catalog: &Catalog, rules: LobbyRules, seed: u64) -> Self {
        let questions = catalog
            .constellations()
            .iter()
            .filter_map(|c| catalog.lobby_question(&c.id))
            .collect();
        let families = catalog
            .families()
            .iter()
            .map(|f| (f.name.clone(), f.total))
            .collect();
        Self {
            backend: Arc::new(Mutex::new(Backend {
                rules,
                questions,
                families,
                lobbies: HashMap::new(),
                progress: HashMap::new(),
                leaderboard: Vec::new(),
                rng: ChaCha8Rng::seed_from_u64(seed),
                fail_status: 0,
                fail_finish: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Backend> {
        self.backend.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Client acting as the logged-in user `name`.
    pub fn client(&self, name: &str) -> InMemoryClient {
        InMemoryClient {
            backend: self.backend.clone(),
            user: Some(name.to_string()),
        }
    }

    /// Client with no logged-in user.
    pub fn anonymous(&self) -> InMemoryClient {
        InMemoryClient {
            backend: self.backend.clone(),
            user: None,
        }
    }

    /// The next `n` status calls fail with a transient network error.
    pub fn fail_next_status(&self, n: u32) {
        self.lock().fail_status = n;
    }

    /// The next `n` finish calls fail with a transient network error.
    pub fn fail_next_finish(&self, n: u32) {
        self.lock().fail_finish = n;
    }

    /// Drop a lobby as if it had expired.
    pub fn remove_lobby(&self, lobby_id: &str) -> bool {
        self.lock().lobbies.remove(lobby_id).is_some()
    }

    pub fn lobby(&self, lobby_id: &str) -> Option<LobbyStatusResponse> {
        self.lock().lobbies.get(lobby_id).map(LobbyRecord::status)
    }

    pub fn lobby_questions(&self, lobby_id: &str) -> Option<Vec<LobbyQuestion>> {
        self.lock()
            .lobbies
            .get(lobby_id)
            .map(|l| l.questions.clone())
    }

    pub fn set_progress(&self, user: &str, family: &str, value: u32) -> Result<()> {
        self.lock().set_progress(user, family, value)
    }

    pub fn progress(&self, user: &str, family: &str) -> u32 {
        self.lock()
            .progress
            .get(user)
            .and_then(|p| p.get(family))
            .copied()
            .unwrap_or(0)
    }

    pub fn leaderboard(&self) -> Vec<LeaderboardEntry> {
        self.lock().leaderboard.clone()
    }
}

/// One participant's view of an [`InMemoryService`].
#[derive(Clone)]
pub struct InMemoryClient {
    backend: Arc<Mutex<Backend>>,
    user: Option<String>,
}

impl InMemoryClient {
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Run `f` against the backend as the logged-in user.
    fn as_user<T>(&self, f: impl FnOnce(&mut Backend, &str) -> Result<T>) -> Ready<Result<T>> {
        let result = match &self.user {
            Some(user) => {
                let mut backend = self.backend.lock().unwrap_or_else(PoisonError::into_inner);
                f(&mut backend, user)
            }
            None => Err(FirmamentError::Rejected("user not logged in".into())),
        };
        ready(result)
    }
}

impl SessionService for InMemoryClient {
    fn fetch_profile(&self) -> impl Future<Output = Result<ProfileResponse>> + Send {
        match &self.user {
            Some(_) => self.as_user(|b, user| Ok(b.profile(user))),
            None => ready(Ok(ProfileResponse::logged_out())),
        }
    }

    fn post_progress(
        &self,
        family: String,
        progress: u32,
    ) -> impl Future<Output = Result<()>> + Send {
        self.as_user(move |b, user| b.set_progress(user, &family, progress))
    }

    fn create_lobby(&self) -> impl Future<Output = Result<CreateLobbyResponse>> + Send {
        self.as_user(|b, user| b.create_lobby(user))
    }

    fn join_lobby(
        &self,
        lobby_id: String,
    ) -> impl Future<Output = Result<JoinLobbyResponse>> + Send {
        self.as_user(move |b, user| b.join_lobby(user, &lobby_id))
    }

    fn lobby_status(
        &self,
        lobby_id: String,
    ) -> impl Future<Output = Result<LobbyStatusResponse>> + Send {
        let mut backend = self.backend.lock().unwrap_or_else(PoisonError::into_inner);
        ready(backend.lobby_status(&lobby_id))
    }

    fn start_lobby(&self, lobby_id: String) -> impl Future<Output = Result<()>> + Send {
        self.as_user(move |b, user| b.start_lobby(user, &lobby_id))
    }

    fn finish_lobby(
        &self,
        lobby_id: String,
        answers: Vec<AnswerWire>,
    ) -> impl Future<Output = Result<()>> + Send {
        self.as_user(move |b, user| b.finish_lobby(user, &lobby_id, &answers))
    }

    fn submit_score(&self, score: u32) -> impl Future<Output = Result<()>> + Send {
        self.as_user(move |b, user| b.submit_score(user, score))
    }

    fn fetch_leaderboard(&self) -> impl Future<Output = Result<Vec<LeaderboardEntry>>> + Send {
        let backend = self.backend.lock().unwrap_or_else(PoisonError::into_inner);
        ready(Ok(backend.leaderboard.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> InMemoryService {
        let catalog = Catalog::builtin().unwrap();
        InMemoryService::new(&catalog, LobbyRules::default(), 42)
    }

    fn q(ra: f64, dec: f64) -> LobbyQuestion {
        LobbyQuestion {
            name: "x".into(),
            ra,
            dec,
        }
    }

    #[test]
    fn score_rewards_closeness() {
        let questions = vec![q(1.0, 0.2)];
        let near = lobby_score(&questions, &[AnswerWire { ra: 1.01, dec: 0.2 }], 100.0);
        let far = lobby_score(&questions, &[AnswerWire { ra: -2.0, dec: -0.2 }], 100.0);
        assert!(near > far);
        assert!(near <= 315);
        assert!(far >= 0);
    }

    #[test]
    fn exact_answer_scores_zero() {
        let questions = vec![q(1.0, 0.2), q(2.0, 0.3)];
        let score = lobby_score(&questions, &[AnswerWire { ra: 1.0, dec: 0.2 }], 100.0);
        assert_eq!(score, 0);
    }

    #[test]
    fn too_many_answers_score_zero() {
        let questions = vec![q(1.0, 0.2)];
        let answers = vec![AnswerWire { ra: 1.1, dec: 0.2 }; 2];
        assert_eq!(lobby_score(&questions, &answers, 100.0), 0);
    }

    #[tokio::test]
    async fn lobby_lifecycle() {
        let svc = service();
        let host = svc.client("Ann");
        let guest = svc.client("Bob");
        let created = host.create_lobby().await.unwrap();
        assert_eq!(created.id.len(), LOBBY_ID_LEN);
        assert_eq!(created.questions.len(), 6);

        let joined = guest.join_lobby(created.id.clone()).await.unwrap();
        assert_eq!(joined.questions, created.questions);
        assert!(matches!(
            guest.start_lobby(created.id.clone()).await,
            Err(FirmamentError::Rejected(_))
        ));
        host.start_lobby(created.id.clone()).await.unwrap();

        let answers: Vec<AnswerWire> = created
            .questions
            .iter()
            .map(|q| AnswerWire { ra: q.ra + 0.01, dec: q.dec })
            .collect();
        host.finish_lobby(created.id.clone(), answers.clone()).await.unwrap();
        let status = host.lobby_status(created.id.clone()).await.unwrap();
        assert_eq!(status.status, LobbyStatus::Started);
        assert_eq!(status.scores["Bob"], -1);

        guest.finish_lobby(created.id.clone(), answers).await.unwrap();
        let status = guest.lobby_status(created.id.clone()).await.unwrap();
        assert_eq!(status.status, LobbyStatus::Ended);
        assert!(status.scores["Ann"] > 0);
    }

    #[tokio::test]
    async fn join_rules() {
        let svc = service();
        let created = svc.client("host").create_lobby().await.unwrap();
        assert!(matches!(
            svc.client("x").join_lobby("missing".into()).await,
            Err(FirmamentError::LobbyNotFound(_))
        ));
        for name in ["a", "b", "c"] {
            svc.client(name).join_lobby(created.id.clone()).await.unwrap();
        }
        assert!(matches!(
            svc.client("d").join_lobby(created.id.clone()).await,
            Err(FirmamentError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn cannot_join_started_lobby() {
        let svc = service();
        let host = svc.client("host");
        let created = host.create_lobby().await.unwrap();
        host.start_lobby(created.id.clone()).await.unwrap();
        assert!(matches!(
            svc.client("late").join_lobby(created.id).await,
            Err(FirmamentError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn fault_injection() {
        let svc = service();
        let host = svc.client("host");
        let created = host.create_lobby().await.unwrap();
        svc.fail_next_status(1);
        assert!(host.lobby_status(created.id.clone()).await.unwrap_err().is_transient());
        assert!(host.lobby_status(created.id.clone()).await.is_ok());
        assert!(svc.remove_lobby(&created.id));
        assert!(matches!(
            host.lobby_status(created.id).await,
            Err(FirmamentError::LobbyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn leaderboard_rules() {
        let mut rules = LobbyRules::default();
        rules.leaderboard_size = 2;
        let svc = InMemoryService::new(&Catalog::builtin().unwrap(), rules, 1);
        assert!(svc.client("a").submit_score(0).await.is_err());
        assert!(svc.client("a").submit_score(89).await.is_err());
        svc.client("a").submit_score(10).await.unwrap();
        svc.client("b").submit_score(30).await.unwrap();
        svc.client("c").submit_score(20).await.unwrap();
        let board = svc.client("a").fetch_leaderboard().await.unwrap();
        let names: Vec<&str> = board.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["b", "c"]);
    }

    #[tokio::test]
    async fn progress_bounded_by_family_total() {
        let svc = service();
        let ann = svc.client("Ann");
        ann.post_progress("Orion".into(), 2).await.unwrap();
        assert!(ann.post_progress("Orion".into(), 6).await.is_err());
        let profile = ann.fetch_profile().await.unwrap();
        let orion = profile.progress.iter().find(|p| p.name == "Orion").unwrap();
        assert_eq!((orion.completed, orion.total), (2, 5));
        assert!(!svc.anonymous().fetch_profile().await.unwrap().logged_in);
        assert!(svc.anonymous().create_lobby().await.is_err());
    }
}
