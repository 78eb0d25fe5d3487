use regex::Regex;
use std::sync::LazyLock;

static TEST_COMMAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(test|tests|jest|vitest|mocha|pytest|rspec|phpunit|nextest|ctest)\b")
        .expect("static regex")
});

static BUILD_COMMAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(build|compile|tsc|check|make|gradle|mvn|webpack|rollup|esbuild)\b")
        .expect("static regex")
});

static CARGO_RESULT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"test result: \w+\. (\d+) passed; (\d+) failed").expect("static regex")
});

static JEST_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*Tests:?\s+(.+)$").expect("static regex"));

static MOCHA_PASSING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) passing").expect("static regex"));
static MOCHA_FAILING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) failing").expect("static regex"));

static PASSED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) passed").expect("static regex"));
static FAILED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) failed").expect("static regex"));
static TOTAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) total|\((\d+)\)").expect("static regex"));

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestCounts {
    pub passed: u64,
    pub failed: u64,
    pub total: u64,
}

pub fn is_test_command(command: &str) -> bool {
    TEST_COMMAND.is_match(command)
}

pub fn is_build_command(command: &str) -> bool {
    BUILD_COMMAND.is_match(command)
}

/// Sum of additions and deletions in `git diff --numstat` output. Binary
/// entries (`-`) count as zero.
pub fn parse_numstat(output: &str) -> (u64, u64) {
    output
        .lines()
        .filter_map(|line| {
            let mut cols = line.splitn(3, '\t');
            let added = cols.next()?;
            let removed = cols.next()?;
            cols.next()?;
            Some((
                added.trim().parse::<u64>().unwrap_or(0),
                removed.trim().parse::<u64>().unwrap_or(0),
            ))
        })
        .fold((0, 0), |(a, r), (da, dr)| (a + da, r + dr))
}

/// Pass/fail counts from test runner output, trying cargo, jest/vitest,
/// mocha and a generic `N passed / M failed` form in that order.
pub fn parse_test_counts(output: &str) -> Option<TestCounts> {
    parse_cargo(output)
        .or_else(|| parse_jest(output))
        .or_else(|| parse_mocha(output))
        .or_else(|| parse_generic(output))
}

// cargo prints one summary per test binary
fn parse_cargo(output: &str) -> Option<TestCounts> {
    let mut counts: Option<TestCounts> = None;
    for caps in CARGO_RESULT.captures_iter(output) {
        let entry = counts.get_or_insert_with(TestCounts::default);
        entry.passed += capture_u64(&caps, 1);
        entry.failed += capture_u64(&caps, 2);
    }
    counts.map(|mut c| {
        c.total = c.passed + c.failed;
        c
    })
}

fn parse_jest(output: &str) -> Option<TestCounts> {
    let line = JEST_LINE
        .captures_iter(output)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .filter(|line| PASSED.is_match(line) || FAILED.is_match(line))
        .last()?;
    let passed = last_number(&PASSED, line);
    let failed = last_number(&FAILED, line);
    let total = TOTAL
        .captures_iter(line)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .filter_map(|m| m.as_str().parse::<u64>().ok())
        .last()
        .unwrap_or(passed + failed);
    Some(TestCounts {
        passed,
        failed,
        total,
    })
}

fn parse_mocha(output: &str) -> Option<TestCounts> {
    if !MOCHA_PASSING.is_match(output) && !MOCHA_FAILING.is_match(output) {
        return None;
    }
    let passed = last_number(&MOCHA_PASSING, output);
    let failed = last_number(&MOCHA_FAILING, output);
    Some(TestCounts {
        passed,
        failed,
        total: passed + failed,
    })
}

fn parse_generic(output: &str) -> Option<TestCounts> {
    if !PASSED.is_match(output) && !FAILED.is_match(output) {
        return None;
    }
    let passed = last_number(&PASSED, output);
    let failed = last_number(&FAILED, output);
    Some(TestCounts {
        passed,
        failed,
        total: passed + failed,
    })
}

fn last_number(pattern: &Regex, text: &str) -> u64 {
    pattern
        .captures_iter(text)
        .last()
        .map(|caps| capture_u64(&caps, 1))
        .unwrap_or(0)
}

fn capture_u64(caps: &regex::Captures<'_>, group: usize) -> u64 {
    caps.get(group)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numstat_sums_and_treats_binary_as_zero() {
        assert_eq!(parse_numstat("50\t10\tfile.ts\n100\t0\tnew.ts\n"), (150, 10));
        assert_eq!(parse_numstat("-\t-\tlogo.png\n3\t1\ta.rs\n"), (3, 1));
        assert_eq!(parse_numstat(""), (0, 0));
    }

    #[test]
    fn jest_summary_line() {
        let counts = parse_test_counts("Tests: 10 passed, 2 failed, 12 total").unwrap();
        assert_eq!(
            counts,
            TestCounts {
                passed: 10,
                failed: 2,
                total: 12
            }
        );
    }

    #[test]
    fn vitest_summary_line() {
        let out = " Test Files  2 passed (2)\n      Tests  7 passed | 1 failed (8)\n";
        let counts = parse_test_counts(out).unwrap();
        assert_eq!(counts.passed, 7);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.total, 8);
    }

    #[test]
    fn cargo_results_are_summed_across_binaries() {
        let out = "test result: ok. 4 passed; 0 failed; 0 ignored\n\
                   test result: FAILED. 2 passed; 1 failed; 0 ignored\n";
        let counts = parse_test_counts(out).unwrap();
        assert_eq!(counts.passed, 6);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.total, 7);
    }

    #[test]
    fn mocha_passing_and_failing() {
        let counts = parse_test_counts("  12 passing (3s)\n  1 failing\n").unwrap();
        assert_eq!((counts.passed, counts.failed, counts.total), (12, 1, 13));
    }

    #[test]
    fn pytest_falls_back_to_generic() {
        let counts = parse_test_counts("==== 5 passed, 2 failed in 0.42s ====").unwrap();
        assert_eq!((counts.passed, counts.failed, counts.total), (5, 2, 7));
    }

    #[test]
    fn unrecognized_output_has_no_counts() {
        assert_eq!(parse_test_counts("all good"), None);
    }

    #[test]
    fn command_classification() {
        assert!(is_test_command("cargo test --workspace"));
        assert!(is_test_command("npx vitest run"));
        assert!(is_test_command("go test ./..."));
        assert!(!is_test_command("cargo build"));
        assert!(is_build_command("cargo check"));
        assert!(is_build_command("npx tsc --noEmit"));
        assert!(is_build_command("npm run build"));
        assert!(!is_build_command("pytest -q"));
    }
}
