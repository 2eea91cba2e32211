//! Rationale selection: named, versioned strategies that decide which peer rationales a
//! student sees during review.
//!
//! Every strategy is a pure function of the seeded generator and the pool snapshot it is
//! given. The pool is sorted by answer id before it reaches a strategy, so the same seed
//! over the same pool always produces the same [`RationaleChoices`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::metrics::SELECTION_ERRORS_TOTAL;
use crate::models::stage::{RationaleBucket, RationaleCandidate};
use crate::models::{Answer, Question, RationaleChoices, StageKey};

use super::answer_store::AnswerStore;
use super::errors::AnsweringError;
use super::quality_filter::RationaleFilter;

/// No eligible candidates could be found; the message is shown to the student.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct SelectionError {
    pub message: String,
}

impl SelectionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Name, version and description recorded with analytics events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlgorithmInfo {
    pub name: String,
    pub version: u32,
    pub description: String,
}

pub struct SelectionInput<'a> {
    pub question: &'a Question,
    pub first_choice: u32,
    pub rationale: &'a str,
    pub per_bucket: usize,
}

pub trait SelectionAlgorithm: Send + Sync {
    fn name(&self) -> &'static str;
    fn version(&self) -> u32;
    fn description(&self) -> &'static str;

    /// `pool` is already quality-filtered, excludes the requesting user and is sorted by id.
    fn select(
        &self,
        rng: &mut StdRng,
        input: &SelectionInput<'_>,
        pool: &[Answer],
    ) -> Result<RationaleChoices, SelectionError>;

    fn info(&self) -> AlgorithmInfo {
        AlgorithmInfo {
            name: self.name().to_string(),
            version: self.version(),
            description: self.description().to_string(),
        }
    }
}

/// Order in which candidates of one bucket are offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ranking {
    Random,
    ExpertFirst,
    ExpertThenVotes,
}

fn rank<'a>(rng: &mut StdRng, ranking: Ranking, mut candidates: Vec<&'a Answer>) -> Vec<&'a Answer> {
    // Shuffle first: the stable sorts below keep the shuffled order among ties
    candidates.shuffle(rng);
    match ranking {
        Ranking::Random => {}
        Ranking::ExpertFirst => candidates.sort_by_key(|a| !a.expert),
        Ranking::ExpertThenVotes => {
            candidates.sort_by(|a, b| b.expert.cmp(&a.expert).then(b.net_votes().cmp(&a.net_votes())))
        }
    }
    candidates
}

/// Picks the bucket compared against the student's first choice.
fn pick_second_choice(
    rng: &mut StdRng,
    question: &Question,
    first_choice: u32,
    by_choice: &BTreeMap<u32, Vec<&Answer>>,
) -> Result<u32, SelectionError> {
    let has_candidates = |choice: &u32| {
        *choice != first_choice && by_choice.get(choice).is_some_and(|c| !c.is_empty())
    };

    // A wrong first answer is always contrasted with a correct one
    let mut alternatives: Vec<u32> = if question.is_correct(first_choice) {
        (1..=question.choice_count()).filter(has_candidates).collect()
    } else {
        question
            .correct_choices()
            .into_iter()
            .filter(has_candidates)
            .collect()
    };

    if alternatives.is_empty() {
        return Err(SelectionError::new(
            "Can't proceed since the course staff did not provide example answers.",
        ));
    }

    alternatives.sort_unstable();
    Ok(alternatives[rng.random_range(0..alternatives.len())])
}

fn select_two_buckets(
    rng: &mut StdRng,
    ranking: Ranking,
    input: &SelectionInput<'_>,
    pool: &[Answer],
) -> Result<RationaleChoices, SelectionError> {
    let mut by_choice: BTreeMap<u32, Vec<&Answer>> = BTreeMap::new();
    for answer in pool {
        if input.question.has_choice(answer.first_answer_choice) && !answer.rationale.trim().is_empty() {
            by_choice.entry(answer.first_answer_choice).or_default().push(answer);
        }
    }

    let second_choice = pick_second_choice(rng, input.question, input.first_choice, &by_choice)?;

    let mut choices = vec![input.first_choice, second_choice];
    choices.sort_unstable();

    let buckets = choices
        .into_iter()
        .map(|choice| {
            let candidates = by_choice.get(&choice).cloned().unwrap_or_default();
            let mut rationales: Vec<RationaleCandidate> = Vec::new();
            if choice == input.first_choice {
                rationales.push(RationaleCandidate {
                    answer_id: None,
                    text: input.rationale.to_string(),
                });
            }
            rationales.extend(
                rank(rng, ranking, candidates)
                    .into_iter()
                    .take(input.per_bucket)
                    .map(|answer| RationaleCandidate {
                        answer_id: Some(answer.id.clone()),
                        text: answer.rationale.clone(),
                    }),
            );
            RationaleBucket {
                choice,
                label: input.question.choice_label(choice),
                rationales,
            }
        })
        .collect();

    Ok(RationaleChoices { buckets })
}

pub struct SimpleAlgorithm;

impl SelectionAlgorithm for SimpleAlgorithm {
    fn name(&self) -> &'static str {
        "simple"
    }

    fn version(&self) -> u32 {
        1
    }

    fn description(&self) -> &'static str {
        "Shows the student's own choice and one alternative choice (a correct one if the \
         first answer was wrong, otherwise an incorrect one), with rationales drawn at random."
    }

    fn select(
        &self,
        rng: &mut StdRng,
        input: &SelectionInput<'_>,
        pool: &[Answer],
    ) -> Result<RationaleChoices, SelectionError> {
        select_two_buckets(rng, Ranking::Random, input, pool)
    }
}

pub struct PreferExpertAlgorithm;

impl SelectionAlgorithm for PreferExpertAlgorithm {
    fn name(&self) -> &'static str {
        "prefer_expert"
    }

    fn version(&self) -> u32 {
        1
    }

    fn description(&self) -> &'static str {
        "Same buckets as the simple algorithm, but expert rationales are always shown first; \
         remaining slots are filled at random."
    }

    fn select(
        &self,
        rng: &mut StdRng,
        input: &SelectionInput<'_>,
        pool: &[Answer],
    ) -> Result<RationaleChoices, SelectionError> {
        select_two_buckets(rng, Ranking::ExpertFirst, input, pool)
    }
}

pub struct PreferExpertAndHighlyVotedAlgorithm;

impl SelectionAlgorithm for PreferExpertAndHighlyVotedAlgorithm {
    fn name(&self) -> &'static str {
        "prefer_expert_and_highly_voted"
    }

    fn version(&self) -> u32 {
        1
    }

    fn description(&self) -> &'static str {
        "Same buckets as the simple algorithm; expert rationales first, then rationales with \
         the highest net votes, ties broken at random."
    }

    fn select(
        &self,
        rng: &mut StdRng,
        input: &SelectionInput<'_>,
        pool: &[Answer],
    ) -> Result<RationaleChoices, SelectionError> {
        select_two_buckets(rng, Ranking::ExpertThenVotes, input, pool)
    }
}

/// Name → strategy lookup, built once at startup.
pub struct AlgorithmRegistry {
    algorithms: HashMap<String, Arc<dyn SelectionAlgorithm>>,
    default_name: String,
}

impl AlgorithmRegistry {
    pub fn builtin(default_name: &str) -> Self {
        let mut registry = Self {
            algorithms: HashMap::new(),
            default_name: default_name.to_string(),
        };
        registry.register(Arc::new(SimpleAlgorithm));
        registry.register(Arc::new(PreferExpertAlgorithm));
        registry.register(Arc::new(PreferExpertAndHighlyVotedAlgorithm));
        if !registry.algorithms.contains_key(default_name) {
            tracing::warn!(
                "Unknown default selection algorithm '{}', using prefer_expert_and_highly_voted",
                default_name
            );
            registry.default_name = "prefer_expert_and_highly_voted".to_string();
        }
        registry
    }

    pub fn register(&mut self, algorithm: Arc<dyn SelectionAlgorithm>) {
        self.algorithms.insert(algorithm.name().to_string(), algorithm);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.algorithms.keys().cloned().collect();
        names.sort();
        names
    }

    /// Unknown names fall back to the default strategy
    pub fn resolve(&self, name: &str) -> Arc<dyn SelectionAlgorithm> {
        if let Some(algorithm) = self.algorithms.get(name) {
            return algorithm.clone();
        }
        tracing::warn!(
            "Selection algorithm '{}' is not registered, falling back to '{}'",
            name,
            self.default_name
        );
        self.algorithms
            .get(&self.default_name)
            .cloned()
            .unwrap_or_else(|| Arc::new(PreferExpertAndHighlyVotedAlgorithm))
    }
}

/// Generator for one answer cycle, seeded from (user, assignment, question, algorithm).
pub fn cycle_rng(key: &StageKey, algorithm: &str) -> StdRng {
    let mut hasher = Sha256::new();
    hasher.update(key.user_token.as_bytes());
    hasher.update(b"|");
    hasher.update(key.assignment_id.as_deref().unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(key.question_id.as_bytes());
    hasher.update(b"|");
    hasher.update(algorithm.as_bytes());
    let digest = hasher.finalize();

    let mut seed = [0u8; 8];
    seed.copy_from_slice(&digest[..8]);
    StdRng::seed_from_u64(u64::from_le_bytes(seed))
}

/// Result of one selection run.
#[derive(Debug, Clone)]
pub struct Selection {
    pub choices: RationaleChoices,
    /// Flat round-robin order for sequential review
    pub sequence: Option<Vec<String>>,
}

/// Loads and filters the candidate pool, then delegates to a strategy.
pub struct RationaleSelectionEngine {
    answers: Arc<dyn AnswerStore>,
    filter: Arc<dyn RationaleFilter>,
    per_bucket: usize,
}

impl RationaleSelectionEngine {
    pub fn new(
        answers: Arc<dyn AnswerStore>,
        filter: Arc<dyn RationaleFilter>,
        per_bucket: usize,
    ) -> Self {
        Self {
            answers,
            filter,
            per_bucket,
        }
    }

    pub async fn select(
        &self,
        algorithm: &dyn SelectionAlgorithm,
        rng: &mut StdRng,
        key: &StageKey,
        first_choice: u32,
        rationale: &str,
        question: &Question,
    ) -> Result<Selection, AnsweringError> {
        let pool = self.candidate_pool(key, question).await?;
        let input = SelectionInput {
            question,
            first_choice,
            rationale,
            per_bucket: self.per_bucket,
        };

        let choices = algorithm.select(rng, &input, &pool).map_err(|e| {
            SELECTION_ERRORS_TOTAL
                .with_label_values(&[algorithm.name()])
                .inc();
            tracing::warn!(
                "Selection failed: question={}, algorithm={}, pool={}, error={}",
                question.id,
                algorithm.name(),
                pool.len(),
                e
            );
            e
        })?;

        tracing::debug!(
            "Selected {} candidates for question={} with algorithm={} from pool of {}",
            choices.candidate_ids().len(),
            question.id,
            algorithm.name(),
            pool.len()
        );

        Ok(Selection {
            choices,
            sequence: None,
        })
    }

    pub async fn select_sequential(
        &self,
        algorithm: &dyn SelectionAlgorithm,
        rng: &mut StdRng,
        key: &StageKey,
        first_choice: u32,
        rationale: &str,
        question: &Question,
    ) -> Result<Selection, AnsweringError> {
        let mut selection = self
            .select(algorithm, rng, key, first_choice, rationale, question)
            .await?;
        selection.sequence = Some(selection.choices.round_robin());
        Ok(selection)
    }

    /// Other students' answers for the question that may be shown, sorted by id.
    async fn candidate_pool(
        &self,
        key: &StageKey,
        question: &Question,
    ) -> Result<Vec<Answer>, AnsweringError> {
        let answers = self.answers.candidate_pool(&question.id).await?;
        let mut pool = Vec::with_capacity(answers.len());
        for answer in answers {
            if answer.user_token == key.user_token && !answer.user_token.is_empty() {
                continue;
            }
            pool.push(answer);
        }
        let mut pool = self.filter.retain_showable(&question.id, pool).await?;
        pool.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnswerChoice, AnswerStyle, GradingScheme, QuestionKind};

    pub(crate) fn four_choice_question() -> Question {
        Question {
            id: "q1".to_string(),
            title: "Forces".to_string(),
            text: "Which is right?".to_string(),
            kind: QuestionKind::PeerInstruction,
            answer_choices: (1..=4)
                .map(|n| AnswerChoice {
                    text: format!("choice {}", n),
                    correct: n == 2 || n == 4,
                })
                .collect(),
            answer_style: AnswerStyle::Alpha,
            grading_scheme: GradingScheme::Standard,
            rationale_selection_algorithm: "simple".to_string(),
            sequential_review: false,
            fake_attributions: false,
        }
    }

    fn peer(id: &str, choice: u32, expert: bool, upvotes: u32) -> Answer {
        Answer {
            id: id.to_string(),
            question_id: "q1".to_string(),
            assignment_id: None,
            user_token: format!("user-{}", id),
            first_answer_choice: choice,
            rationale: format!("rationale {}", id),
            second_answer_choice: Some(choice),
            chosen_rationale_id: None,
            expert,
            sample: false,
            upvotes,
            downvotes: 0,
            datetime_start: None,
            datetime_first: None,
            datetime_second: None,
            grade: None,
            cycle_key: None,
        }
    }

    fn pool() -> Vec<Answer> {
        let mut pool = Vec::new();
        for choice in 1..=4 {
            for n in 0..5 {
                pool.push(peer(&format!("c{}-{}", choice, n), choice, false, n));
            }
        }
        pool
    }

    fn input(question: &Question, first_choice: u32) -> SelectionInput<'_> {
        SelectionInput {
            question,
            first_choice,
            rationale: "This is long enough text",
            per_bucket: 3,
        }
    }

    #[test]
    fn test_selection_is_deterministic_for_same_seed() {
        let question = four_choice_question();
        let key = StageKey::new("student", Some("a1"), "q1");
        let first = SimpleAlgorithm
            .select(&mut cycle_rng(&key, "simple"), &input(&question, 2), &pool())
            .unwrap();
        let second = SimpleAlgorithm
            .select(&mut cycle_rng(&key, "simple"), &input(&question, 2), &pool())
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_keep_own_entry_only_in_first_choice_bucket() {
        let question = four_choice_question();
        let key = StageKey::new("student", None, "q1");
        let choices = SimpleAlgorithm
            .select(&mut cycle_rng(&key, "simple"), &input(&question, 2), &pool())
            .unwrap();

        assert_eq!(choices.buckets.len(), 2);
        let own = choices.bucket(2).unwrap();
        assert_eq!(own.rationales[0].answer_id, None);
        assert_eq!(own.rationales[0].text, "This is long enough text");
        assert_eq!(own.rationales.len(), 4);

        let other = choices.buckets.iter().find(|b| b.choice != 2).unwrap();
        assert!(other.rationales.iter().all(|r| r.answer_id.is_some()));
        assert_eq!(other.rationales.len(), 3);
    }

    #[test]
    fn test_correct_first_choice_may_be_contrasted_with_any_other_choice() {
        let question = four_choice_question();
        let mut offered = std::collections::BTreeSet::new();
        for n in 0..40 {
            let key = StageKey::new(&format!("student-{}", n), None, "q1");
            let choices = SimpleAlgorithm
                .select(&mut cycle_rng(&key, "simple"), &input(&question, 2), &pool())
                .unwrap();
            offered.insert(choices.buckets.iter().find(|b| b.choice != 2).unwrap().choice);
        }
        assert_eq!(offered.into_iter().collect::<Vec<_>>(), vec![1, 3, 4]);
    }

    #[test]
    fn test_incorrect_first_choice_gets_correct_alternative() {
        let question = four_choice_question();
        let key = StageKey::new("student", None, "q1");
        let choices = SimpleAlgorithm
            .select(&mut cycle_rng(&key, "simple"), &input(&question, 1), &pool())
            .unwrap();
        let other = choices.buckets.iter().find(|b| b.choice != 1).unwrap();
        assert!(question.is_correct(other.choice));
    }

    #[test]
    fn test_no_alternative_candidates_is_selection_error() {
        let question = four_choice_question();
        let key = StageKey::new("student", None, "q1");
        let only_first: Vec<Answer> = pool()
            .into_iter()
            .filter(|a| a.first_answer_choice == 1)
            .collect();
        let err = SimpleAlgorithm
            .select(&mut cycle_rng(&key, "simple"), &input(&question, 1), &only_first)
            .unwrap_err();
        assert!(err.message.contains("example answers"));
    }

    #[test]
    fn test_expert_and_votes_ranking() {
        let question = four_choice_question();
        let key = StageKey::new("student", None, "q1");
        let mut pool = pool();
        pool.push(peer("expert-2", 2, true, 0));
        pool.sort_by(|a, b| a.id.cmp(&b.id));

        let choices = PreferExpertAndHighlyVotedAlgorithm
            .select(
                &mut cycle_rng(&key, "prefer_expert_and_highly_voted"),
                &input(&question, 2),
                &pool,
            )
            .unwrap();
        let own = choices.bucket(2).unwrap();
        let ids: Vec<&str> = own
            .rationales
            .iter()
            .filter_map(|r| r.answer_id.as_deref())
            .collect();
        assert_eq!(ids, vec!["expert-2", "c2-4", "c2-3"]);
    }

    #[test]
    fn test_registry_falls_back_to_default() {
        let registry = AlgorithmRegistry::builtin("simple");
        assert_eq!(registry.resolve("does-not-exist").name(), "simple");
        assert_eq!(registry.resolve("prefer_expert").name(), "prefer_expert");
        assert_eq!(
            registry.names(),
            vec!["prefer_expert", "prefer_expert_and_highly_voted", "simple"]
        );
    }

    #[test]
    fn test_cycle_rng_depends_on_every_key_part() {
        let base = StageKey::new("u", Some("a"), "q");
        let a: u64 = cycle_rng(&base, "simple").random();
        let b: u64 = cycle_rng(&base, "simple").random();
        let c: u64 = cycle_rng(&StageKey::new("u", None, "q"), "simple").random();
        let d: u64 = cycle_rng(&base, "prefer_expert").random();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }
}
