//! Tie-break resolution for ambiguous oracle arguments.
//!
//! When both arguments of a containment/match assertion carry the same
//! name density, the classifier cannot tell which side is the expected
//! value. The decision is delegated to a [`TieBreakResolver`]; answers are
//! memoized per (call path, argument index, test name) so a site is never
//! asked about twice, and an answer recorded for one argument of a call
//! implies the opposite answer for the other argument.

use std::collections::HashMap;
use std::io::{self, BufRead, Write};

/// One ambiguous-argument question for a specific assertion call site.
#[derive(Debug, Clone)]
pub struct TieBreakQuery {
    /// Path of the call's function node within the test body.
    pub call_path: String,
    /// Which argument (counting from 0) is being asked about.
    pub arg_index: usize,
    /// Name of the test method containing the call.
    pub test_name: String,
    /// Unqualified assertion name, e.g. `assertIn`.
    pub callee: String,
    /// Source text of the assertion statement, for display.
    pub line_text: String,
}

/// Decides whether an ambiguous argument is an oracle.
pub trait TieBreakResolver {
    fn resolve(&mut self, query: &TieBreakQuery) -> bool;
}

impl<T: TieBreakResolver + ?Sized> TieBreakResolver for Box<T> {
    fn resolve(&mut self, query: &TieBreakQuery) -> bool {
        (**self).resolve(query)
    }
}

/// Always answers "yes". Used when prompting is suppressed.
pub struct AutoGuess;

impl TieBreakResolver for AutoGuess {
    fn resolve(&mut self, _query: &TieBreakQuery) -> bool {
        true
    }
}

/// Blocks on stdin for a Y/n answer.
pub struct Interactive;

impl TieBreakResolver for Interactive {
    fn resolve(&mut self, query: &TieBreakQuery) -> bool {
        let stdin = io::stdin();
        let mut lines = stdin.lock().lines();
        loop {
            print!(
                "HELP NEEDED: Is argument {} (counting from 0) of {} on the line `{}` an oracle argument? Y/n: ",
                query.arg_index, query.callee, query.line_text
            );
            let _ = io::stdout().flush();
            let answer = match lines.next() {
                Some(Ok(line)) => line.trim().to_uppercase(),
                // stdin closed; fall back to the affirmative default.
                _ => "Y".to_string(),
            };
            match answer.as_str() {
                "Y" | "" => return true,
                "N" => return false,
                _ => continue,
            }
        }
    }
}

/// Memoization layer shared by all resolver implementations. Append-only for
/// the life of a run.
pub struct Memoized<R: TieBreakResolver> {
    inner: R,
    cache: HashMap<(String, usize, String), bool>,
}

impl<R: TieBreakResolver> Memoized<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            cache: HashMap::new(),
        }
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

impl<R: TieBreakResolver> TieBreakResolver for Memoized<R> {
    fn resolve(&mut self, query: &TieBreakQuery) -> bool {
        let key = (
            query.call_path.clone(),
            query.arg_index,
            query.test_name.clone(),
        );
        if let Some(&answer) = self.cache.get(&key) {
            return answer;
        }
        // An answer for the other argument of the same call implies the
        // opposite answer here.
        let sibling = self
            .cache
            .iter()
            .find(|((path, idx, test), _)| {
                *path == query.call_path && *test == query.test_name && *idx != query.arg_index
            })
            .map(|(_, &answer)| !answer);
        let answer = match sibling {
            Some(derived) => derived,
            None => self.inner.resolve(query),
        };
        self.cache.insert(key, answer);
        answer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Counts invocations and returns a scripted answer.
    struct Scripted {
        answer: bool,
        calls: usize,
    }

    impl TieBreakResolver for Scripted {
        fn resolve(&mut self, _query: &TieBreakQuery) -> bool {
            self.calls += 1;
            self.answer
        }
    }

    fn query(path: &str, arg: usize, test: &str) -> TieBreakQuery {
        TieBreakQuery {
            call_path: path.to_string(),
            arg_index: arg,
            test_name: test.to_string(),
            callee: "assertIn".to_string(),
            line_text: "self.assertIn(a, b)".to_string(),
        }
    }

    #[test]
    fn test_auto_guess_always_yes() {
        let mut resolver = AutoGuess;
        assert!(resolver.resolve(&query(".x", 0, "t")));
        assert!(resolver.resolve(&query(".y", 1, "t")));
    }

    #[test]
    fn test_memoized_asks_once_per_key() {
        let mut resolver = Memoized::new(Scripted {
            answer: true,
            calls: 0,
        });
        assert!(resolver.resolve(&query(".a", 0, "t")));
        assert!(resolver.resolve(&query(".a", 0, "t")));
        assert!(resolver.resolve(&query(".a", 0, "t")));
        assert_eq!(resolver.inner.calls, 1);
    }

    #[test]
    fn test_memoized_inverts_for_other_argument() {
        let mut resolver = Memoized::new(Scripted {
            answer: true,
            calls: 0,
        });
        assert!(resolver.resolve(&query(".a", 0, "t")));
        // Same site, other argument: derived without consulting the inner
        // resolver, and inverted.
        assert!(!resolver.resolve(&query(".a", 1, "t")));
        assert_eq!(resolver.inner.calls, 1);
        assert_eq!(resolver.cache_len(), 2);
    }

    #[test]
    fn test_memoized_distinguishes_tests_and_sites() {
        let mut resolver = Memoized::new(Scripted {
            answer: false,
            calls: 0,
        });
        assert!(!resolver.resolve(&query(".a", 0, "t1")));
        assert!(!resolver.resolve(&query(".a", 0, "t2")));
        assert!(!resolver.resolve(&query(".b", 0, "t1")));
        assert_eq!(resolver.inner.calls, 3);
    }
}
