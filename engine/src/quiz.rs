//! Quiz engine: shuffled question sequence, answers, optional shared
//! countdown and a single finalization.

use crate::catalog::{Catalog, Family};
use crate::error::{FirmamentError, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct Question {
    pub prompt: String,
    pub correct_answer: String,
    answered: bool,
    was_correct: Option<bool>,
}

impl Question {
    pub fn new(prompt: impl Into<String>, correct_answer: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            correct_answer: correct_answer.into(),
            answered: false,
            was_correct: None,
        }
    }

    /// Record an answer. Case is ignored, whitespace is not. Only the first
    /// answer counts.
    pub fn answer(&mut self, text: &str) -> Result<bool> {
        if self.answered {
            return Err(FirmamentError::AlreadyAnswered);
        }
        let correct = text.to_lowercase() == self.correct_answer.to_lowercase();
        self.answered = true;
        self.was_correct = Some(correct);
        Ok(correct)
    }

    pub fn is_answered(&self) -> bool {
        self.answered
    }

    pub fn was_correct(&self) -> Option<bool> {
        self.was_correct
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QuizResult {
    pub correct: usize,
    pub total: usize,
    pub percent: f64,
    pub pass: bool,
}

impl QuizResult {
    /// Pass requires strictly more than `pass_threshold` correct.
    pub fn evaluate(questions: &[Question], pass_threshold: f64) -> Self {
        let total = questions.len();
        let correct = questions
            .iter()
            .filter(|q| q.was_correct == Some(true))
            .count();
        let percent = if total == 0 {
            0.0
        } else {
            correct as f64 / total as f64
        };
        Self {
            correct,
            total,
            percent,
            pass: percent > pass_threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuizPhase {
    Created,
    InProgress,
    Finished,
}

pub type ResultCallback = Box<dyn FnOnce(&QuizResult) + Send>;

pub struct Quiz {
    questions: Vec<Question>,
    cursor: usize,
    phase: QuizPhase,
    pass_threshold: f64,
    deadline: Option<Instant>,
    on_result: Option<ResultCallback>,
    result: Option<QuizResult>,
}

impl Quiz {
    /// Build a quiz; the question order is shuffled once here and then fixed.
    pub fn new(mut questions: Vec<Question>, pass_threshold: f64, rng: &mut impl Rng) -> Self {
        questions.shuffle(rng);
        Self {
            questions,
            cursor: 0,
            phase: QuizPhase::Created,
            pass_threshold,
            deadline: None,
            on_result: None,
            result: None,
        }
    }

    /// One countdown for the whole quiz, starting at `now`.
    pub fn with_time_limit(mut self, limit: Duration, now: Instant) -> Self {
        self.deadline = Some(now + limit);
        self
    }

    pub fn on_result(mut self, callback: ResultCallback) -> Self {
        self.on_result = Some(callback);
        self
    }

    pub fn phase(&self) -> QuizPhase {
        self.phase
    }

    pub fn is_finished(&self) -> bool {
        self.phase == QuizPhase::Finished
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }

    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    pub fn result(&self) -> Option<&QuizResult> {
        self.result.as_ref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn time_remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    pub fn current_question(&self) -> Option<&Question> {
        if self.is_finished() {
            return None;
        }
        self.questions.get(self.cursor)
    }

    pub fn submit_answer(&mut self, text: &str) -> Result<bool> {
        if self.is_finished() {
            return Err(FirmamentError::AlreadyFinished);
        }
        let question = self
            .questions
            .get_mut(self.cursor)
            .ok_or(FirmamentError::NoActiveQuiz)?;
        let correct = question.answer(text)?;
        self.phase = QuizPhase::InProgress;
        Ok(correct)
    }

    /// Move to the next question. Running off the end finalizes the quiz and
    /// returns its result.
    pub fn advance(&mut self) -> Result<Option<QuizResult>> {
        if self.is_finished() {
            return Err(FirmamentError::AlreadyFinished);
        }
        self.phase = QuizPhase::InProgress;
        if self.cursor < self.questions.len() {
            self.cursor += 1;
        }
        if self.cursor >= self.questions.len() {
            return self.finalize().map(Some);
        }
        Ok(None)
    }

    /// Finalize if the countdown has run out by `now`.
    pub fn expire(&mut self, now: Instant) -> Result<Option<QuizResult>> {
        if self.is_finished() {
            return Err(FirmamentError::AlreadyFinished);
        }
        match self.deadline {
            Some(deadline) if now >= deadline => self.finalize().map(Some),
            _ => Ok(None),
        }
    }

    /// Compute the result and hand it to the callback. Runs exactly once.
    pub fn finalize(&mut self) -> Result<QuizResult> {
        if self.is_finished() {
            return Err(FirmamentError::AlreadyFinished);
        }
        let result = QuizResult::evaluate(&self.questions, self.pass_threshold);
        self.phase = QuizPhase::Finished;
        self.result = Some(result);
        if let Some(callback) = self.on_result.take() {
            callback(&result);
        }
        tracing::debug!(
            "Quiz finished: {}/{} correct, pass={}",
            result.correct,
            result.total,
            result.pass
        );
        Ok(result)
    }
}

/// One question per catalog constellation.
pub fn challenge_questions(catalog: &Catalog, prompt: &str) -> Vec<Question> {
    catalog
        .constellations()
        .iter()
        .map(|c| Question::new(prompt, c.id.clone()))
        .collect()
}

/// Every constellation of `group`, plus each constellation of an earlier
/// group with probability `prior_inclusion`.
pub fn test_questions(
    family: &Family,
    group: usize,
    prior_inclusion: f64,
    prompt: &str,
    rng: &mut impl Rng,
) -> Result<Vec<Question>> {
    let mut questions: Vec<Question> = family
        .group(group)?
        .iter()
        .map(|name| Question::new(prompt, name.clone()))
        .collect();
    for earlier in &family.groups()[..group] {
        for name in earlier {
            if rng.gen_bool(prior_inclusion) {
                questions.push(Question::new(prompt, name.clone()));
            }
        }
    }
    Ok(questions)
}

/// Progress to record after a test of `group`, if any.
///
/// A pass counts every constellation in groups `0..=group`; it is only
/// recorded when it moves progress forward and stays within the family total.
pub fn progress_after(
    family: &Family,
    group: usize,
    result: &QuizResult,
    completed: u32,
) -> Result<Option<u32>> {
    if !result.pass {
        return Ok(None);
    }
    let progress = family.constellations_through(group)?;
    if progress > completed && progress <= family.total {
        Ok(Some(progress))
    } else {
        Ok(None)
    }
}
