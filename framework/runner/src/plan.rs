use gust_core::prelude::SuiteInfo;

/// The order in which a suite's selected tests run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestPlan {
    /// Run one at a time, in declared order.
    pub sequential: Vec<String>,
    /// Run concurrently with each other once the sequential tests are done.
    pub parallel: Vec<String>,
}

impl TestPlan {
    pub fn len(&self) -> usize {
        self.sequential.len() + self.parallel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn plan_tests(suite: &SuiteInfo) -> TestPlan {
    let (parallel, sequential) = suite
        .tests
        .iter()
        .cloned()
        .partition(|test| suite.parallel_tests.contains(test));

    TestPlan {
        sequential,
        parallel,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sequential_tests_keep_declared_order() {
        let suite = SuiteInfo {
            name: "MapSuite".to_string(),
            tests: ["TestPut", "TestScan", "TestGet", "TestRemove"]
                .map(String::from)
                .to_vec(),
            benchmarks: vec![],
            parallel_tests: vec!["TestScan".to_string(), "TestRemove".to_string()],
        };

        let plan = plan_tests(&suite);
        assert_eq!(
            TestPlan {
                sequential: vec!["TestPut".to_string(), "TestGet".to_string()],
                parallel: vec!["TestScan".to_string(), "TestRemove".to_string()],
            },
            plan
        );
        assert_eq!(4, plan.len());
    }
}
