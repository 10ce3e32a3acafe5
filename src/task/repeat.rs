//! The `repeat` combinator: fan a task class out over a parameter grid.

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::artifact::{ArcArtifact, CompositeArtifact};
use crate::error::AqueductError;
use crate::tree::WorkTree;

use super::{ArcTask, Exec, SimpleTask, Task};

/// Builds one child task from a fully-merged argument row.
pub type RowFn = dyn Fn(&Map<String, Value>) -> ArcTask + Send + Sync;

/// An aggregate task whose requirements are the Cartesian product of its
/// iterators, each row merged with the fixed arguments and handed to the
/// row function.
///
/// The aggregate's artifact is the composite of the children's artifacts
/// (absent when no child has one), so the whole grid gates as one unit.
/// Its result is the list of child results, which is also what the
/// composite loads back.
pub struct Repeat {
    name: String,
    iterators: IndexMap<String, Vec<Value>>,
    fixed: Map<String, Value>,
    row_fn: Arc<RowFn>,
}

impl std::fmt::Debug for Repeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repeat")
            .field("name", &self.name)
            .field("iterators", &self.iterators)
            .field("fixed", &self.fixed)
            .finish()
    }
}

impl Repeat {
    /// Rejects any key appearing both as an iterator and as a fixed
    /// argument.
    pub fn new(
        name: impl Into<String>,
        iterators: IndexMap<String, Vec<Value>>,
        fixed: Map<String, Value>,
        row_fn: impl Fn(&Map<String, Value>) -> ArcTask + Send + Sync + 'static,
    ) -> Result<Arc<Self>, AqueductError> {
        for key in iterators.keys() {
            if fixed.contains_key(key) {
                return Err(AqueductError::RepeatedParameter(key.clone()));
            }
        }
        Ok(Arc::new(Self {
            name: name.into(),
            iterators,
            fixed,
            row_fn: Arc::new(row_fn),
        }))
    }

    fn rows(&self) -> Vec<Map<String, Value>> {
        let keys: Vec<&String> = self.iterators.keys().collect();
        let mut rows: Vec<Map<String, Value>> = vec![self.fixed.clone()];
        for key in keys {
            let values = &self.iterators[key];
            let mut next = Vec::with_capacity(rows.len() * values.len());
            for row in &rows {
                for value in values {
                    let mut merged = row.clone();
                    merged.insert(key.clone(), value.clone());
                    next.push(merged);
                }
            }
            rows = next;
        }
        rows
    }

    fn children(&self) -> Vec<ArcTask> {
        self.rows().iter().map(|row| (self.row_fn)(row)).collect()
    }
}

impl Task for Repeat {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn args(&self) -> Value {
        let mut args = Map::new();
        let iterators: Map<String, Value> = self
            .iterators
            .iter()
            .map(|(k, v)| (k.clone(), Value::Array(v.clone())))
            .collect();
        args.insert("iterators".into(), Value::Object(iterators));
        args.insert("fixed".into(), Value::Object(self.fixed.clone()));
        Value::Object(args)
    }

    fn exec(&self) -> Exec<'_> {
        Exec::Simple(self)
    }

    fn requirements(&self) -> Option<WorkTree> {
        Some(WorkTree::List(
            self.children().into_iter().map(WorkTree::Task).collect(),
        ))
    }

    fn artifact(&self) -> Option<ArcArtifact> {
        let artifacts: Vec<ArcArtifact> = self
            .children()
            .iter()
            .filter_map(|child| child.artifact())
            .collect();
        if artifacts.is_empty() {
            None
        } else {
            Some(CompositeArtifact::shared(artifacts))
        }
    }
}

impl SimpleTask for Repeat {
    fn run(&self, requirements: Option<Value>) -> Result<Value, AqueductError> {
        // The children did the work; the aggregate's value is their results,
        // which matches what the composite artifact loads back.
        Ok(requirements.unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::memory::{InMemoryArtifact, MemoryStore};
    use crate::task::testing::Constant;
    use serde_json::json;

    fn grid() -> IndexMap<String, Vec<Value>> {
        let mut iterators = IndexMap::new();
        iterators.insert("x".to_string(), vec![json!(1), json!(2)]);
        iterators.insert("y".to_string(), vec![json!(10), json!(20)]);
        iterators
    }

    #[test]
    fn requirements_are_the_cartesian_product() {
        let repeat = Repeat::new("Grid", grid(), Map::new(), |row| {
            let x = row["x"].as_i64().unwrap();
            let y = row["y"].as_i64().unwrap();
            Constant::new(json!(x + y)) as ArcTask
        })
        .unwrap();

        let requirements = repeat.requirements().unwrap();
        let values: Vec<Value> = requirements
            .tasks()
            .iter()
            .map(|t| t.args()["value"].clone())
            .collect();
        assert_eq!(values, vec![json!(11), json!(21), json!(12), json!(22)]);
    }

    #[test]
    fn colliding_keys_are_rejected() {
        let mut fixed = Map::new();
        fixed.insert("x".into(), json!(0));
        let err = Repeat::new("Grid", grid(), fixed, |_row| {
            Constant::new(json!(0)) as ArcTask
        })
        .unwrap_err();
        assert!(matches!(err, AqueductError::RepeatedParameter(k) if k == "x"));
    }

    #[test]
    fn fixed_arguments_reach_every_row() {
        let mut iterators = IndexMap::new();
        iterators.insert("x".to_string(), vec![json!(1), json!(2)]);
        let mut fixed = Map::new();
        fixed.insert("offset".into(), json!(100));

        let repeat = Repeat::new("Grid", iterators, fixed, |row| {
            let x = row["x"].as_i64().unwrap();
            let offset = row["offset"].as_i64().unwrap();
            Constant::new(json!(x + offset)) as ArcTask
        })
        .unwrap();

        let values: Vec<Value> = repeat
            .requirements()
            .unwrap()
            .tasks()
            .iter()
            .map(|t| t.args()["value"].clone())
            .collect();
        assert_eq!(values, vec![json!(101), json!(102)]);
    }

    #[test]
    fn artifact_is_the_children_composite() {
        let _serial = crate::context::test_lock();
        let store = MemoryStore::new();
        let repeat = {
            let store = store.clone();
            Repeat::new("Grid", grid(), Map::new(), move |row| {
                let key = format!("{}-{}", row["x"], row["y"]);
                Constant::with_artifact(
                    json!(0),
                    InMemoryArtifact::shared(key, store.clone()),
                ) as ArcTask
            })
            .unwrap()
        };

        let artifact = repeat.artifact().unwrap();
        assert!(!artifact.exists());
        assert_eq!(artifact.children().unwrap().len(), 4);
    }

    #[test]
    fn empty_grid_yields_one_fixed_row() {
        let mut fixed = Map::new();
        fixed.insert("only".into(), json!(7));
        let repeat = Repeat::new("Grid", IndexMap::new(), fixed, |row| {
            Constant::new(row["only"].clone()) as ArcTask
        })
        .unwrap();
        assert_eq!(repeat.requirements().unwrap().tasks().len(), 1);
    }
}
