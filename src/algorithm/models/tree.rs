//! Classification tree imputer
//!
//! A small CART classifier with Gini splits. Leaves keep the class
//! frequencies of their training rows, and sampling draws a class from the
//! leaf a record falls into, so the imputation reflects the conditional
//! distribution instead of the majority class.

use rand::rngs::StdRng;
use rustc_hash::FxHashMap;

use super::{FitError, FittedImputer, Imputer, ModelFamily, TrainingData, check_width};
use crate::algorithm::sampling::draw_weighted;
use crate::models::{Value, VariableSpec};

/// Growth limits for the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeParams {
    pub max_depth: usize,
    pub min_leaf: usize,
}

impl Default for TreeParams {
    fn default() -> Self {
        Self {
            max_depth: 4,
            min_leaf: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Leaf {
        counts: Vec<f64>,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// Decision-tree imputer for categorical and binary variables
#[derive(Debug, Clone)]
pub struct ClassificationTreeImputer {
    levels: Vec<String>,
    params: TreeParams,
}

impl ClassificationTreeImputer {
    /// Use the declared levels of the variable; an empty level list means
    /// the classes are taken from the training data
    #[must_use]
    pub fn new(spec: &VariableSpec) -> Self {
        Self {
            levels: spec.levels.clone(),
            params: TreeParams::default(),
        }
    }

    #[must_use]
    pub const fn with_params(mut self, params: TreeParams) -> Self {
        self.params = params;
        self
    }
}

struct FittedTree {
    nodes: Vec<Node>,
    classes: Vec<String>,
    width: usize,
}

fn gini(counts: &[f64], total: f64) -> f64 {
    if total <= 0.0 {
        return 0.0;
    }
    1.0 - counts.iter().map(|c| (c / total).powi(2)).sum::<f64>()
}

struct Builder<'a> {
    features: &'a [Vec<f64>],
    labels: &'a [usize],
    classes: usize,
    params: TreeParams,
    nodes: Vec<Node>,
}

impl Builder<'_> {
    fn counts(&self, rows: &[usize]) -> Vec<f64> {
        let mut counts = vec![0.0; self.classes];
        for &r in rows {
            counts[self.labels[r]] += 1.0;
        }
        counts
    }

    /// Best (feature, threshold, weighted impurity) over all features
    fn best_split(&self, rows: &[usize], parent: &[f64]) -> Option<(usize, f64, f64)> {
        let n = rows.len() as f64;
        let width = self.features.first().map_or(0, Vec::len);
        let mut best: Option<(usize, f64, f64)> = None;
        let mut order = rows.to_vec();

        for feature in 0..width {
            order.sort_by(|&a, &b| {
                self.features[a][feature].total_cmp(&self.features[b][feature])
            });
            let mut left = vec![0.0; self.classes];
            let mut right = parent.to_vec();
            for i in 0..order.len() - 1 {
                let label = self.labels[order[i]];
                left[label] += 1.0;
                right[label] -= 1.0;

                let here = self.features[order[i]][feature];
                let next = self.features[order[i + 1]][feature];
                let n_left = (i + 1) as f64;
                let n_right = n - n_left;
                if here == next
                    || (i + 1) < self.params.min_leaf
                    || order.len() - (i + 1) < self.params.min_leaf
                {
                    continue;
                }
                let impurity =
                    (n_left * gini(&left, n_left) + n_right * gini(&right, n_right)) / n;
                if best.is_none_or(|(_, _, b)| impurity < b) {
                    best = Some((feature, (here + next) / 2.0, impurity));
                }
            }
        }
        best
    }

    fn grow(&mut self, rows: Vec<usize>, depth: usize) -> usize {
        let counts = self.counts(&rows);
        let total = rows.len() as f64;
        let impurity = gini(&counts, total);

        let split = if depth < self.params.max_depth
            && rows.len() >= 2 * self.params.min_leaf
            && impurity > 0.0
        {
            self.best_split(&rows, &counts)
                .filter(|(_, _, child)| *child + 1e-12 < impurity)
        } else {
            None
        };

        let Some((feature, threshold, _)) = split else {
            self.nodes.push(Node::Leaf { counts });
            return self.nodes.len() - 1;
        };

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .into_iter()
            .partition(|&r| self.features[r][feature] <= threshold);

        let id = self.nodes.len();
        self.nodes.push(Node::Leaf { counts: Vec::new() });
        let left = self.grow(left_rows, depth + 1);
        let right = self.grow(right_rows, depth + 1);
        self.nodes[id] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        id
    }
}

impl Imputer for ClassificationTreeImputer {
    fn family(&self) -> ModelFamily {
        ModelFamily::ClassificationTree
    }

    fn fit(
        &self,
        data: &TrainingData,
        _rng: &mut StdRng,
    ) -> Result<Box<dyn FittedImputer>, FitError> {
        if data.is_empty() {
            return Err(FitError::NoTrainingData);
        }

        let mut classes = self.levels.clone();
        let mut lookup: FxHashMap<String, usize> = classes
            .iter()
            .enumerate()
            .map(|(i, c)| (c.clone(), i))
            .collect();
        let open_levels = classes.is_empty();
        if open_levels {
            let mut observed: Vec<&str> = data
                .targets
                .iter()
                .filter_map(Value::as_category)
                .collect();
            observed.sort_unstable();
            observed.dedup();
            for level in observed {
                lookup.insert(level.to_string(), classes.len());
                classes.push(level.to_string());
            }
        }

        let labels = data
            .targets
            .iter()
            .map(|v| {
                let level = v.as_category().ok_or_else(|| FitError::WrongKind(v.clone()))?;
                lookup
                    .get(level)
                    .copied()
                    .ok_or_else(|| FitError::UnknownLevel(level.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let width = data.width();
        if data.features.iter().any(|row| row.len() != width) {
            return Err(FitError::FeatureWidth {
                expected: width,
                actual: data.features.iter().map(Vec::len).find(|&w| w != width).unwrap_or(0),
            });
        }
        if data.features.iter().flatten().any(|x| !x.is_finite()) {
            return Err(FitError::NonFinite("tree features".to_string()));
        }

        let mut builder = Builder {
            features: &data.features,
            labels: &labels,
            classes: classes.len(),
            params: self.params,
            nodes: Vec::new(),
        };
        let root = builder.grow((0..labels.len()).collect(), 0);
        debug_assert_eq!(root, 0);

        Ok(Box::new(FittedTree {
            nodes: builder.nodes,
            classes,
            width,
        }))
    }
}

impl FittedTree {
    fn leaf(&self, features: &[f64]) -> &[f64] {
        let mut id = 0;
        loop {
            match &self.nodes[id] {
                Node::Leaf { counts } => return counts,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    id = if features[*feature] <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }
}

impl FittedImputer for FittedTree {
    fn sample(&self, features: &[f64], rng: &mut StdRng) -> Result<Value, FitError> {
        check_width(self.width, features)?;
        let counts = self.leaf(features);
        let idx = draw_weighted(counts, rng)
            .ok_or_else(|| FitError::NonFinite("empty leaf distribution".to_string()))?;
        Ok(Value::category(self.classes[idx].clone()))
    }
}
