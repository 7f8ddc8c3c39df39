//! Weighted random selection.
//!
//! [`Weighted`] samples one option from a fixed, non-empty set. With weights
//! each option is chosen with probability `weight / sum(weights)`; without
//! them every option is equally likely. Each call consumes exactly one draw
//! from the caller's random source.

use rand::Rng;

/// Errors produced when constructing a [`Weighted`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq)]
pub enum Error {
    /// There must be at least one option.
    #[error("no options to choose from")]
    Empty,
    /// Options and weights must pair up one to one.
    #[error("{options} options but {weights} weights")]
    LengthMismatch {
        /// Number of options supplied
        options: usize,
        /// Number of weights supplied
        weights: usize,
    },
    /// Every weight must be finite and strictly positive.
    #[error("weight {weight} at index {index} is not a positive finite number")]
    InvalidWeight {
        /// Position of the offending weight
        index: usize,
        /// The offending weight
        weight: f64,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Shape {
    Uniform,
    Cumulative { sums: Vec<f64>, total: f64 },
}

/// A discrete distribution over a set of options.
#[derive(Debug, Clone, PartialEq)]
pub struct Weighted<T> {
    options: Vec<T>,
    shape: Shape,
}

impl<T> Weighted<T> {
    /// Create a uniform [`Weighted`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Empty`] if `options` is empty.
    pub fn uniform(options: Vec<T>) -> Result<Self, Error> {
        if options.is_empty() {
            return Err(Error::Empty);
        }
        Ok(Self {
            options,
            shape: Shape::Uniform,
        })
    }

    /// Create a [`Weighted`] where `weights[i]` is the relative weight of
    /// `options[i]`.
    ///
    /// # Errors
    ///
    /// Returns an error if `options` is empty, the two slices differ in
    /// length or any weight is not strictly positive and finite.
    pub fn new(options: Vec<T>, weights: &[f64]) -> Result<Self, Error> {
        if options.is_empty() {
            return Err(Error::Empty);
        }
        if options.len() != weights.len() {
            return Err(Error::LengthMismatch {
                options: options.len(),
                weights: weights.len(),
            });
        }

        let mut sums = Vec::with_capacity(weights.len());
        let mut total = 0.0;
        for (index, &weight) in weights.iter().enumerate() {
            if !weight.is_finite() || weight <= 0.0 {
                return Err(Error::InvalidWeight { index, weight });
            }
            total += weight;
            sums.push(total);
        }
        if !total.is_finite() {
            return Err(Error::InvalidWeight {
                index: weights.len() - 1,
                weight: weights[weights.len() - 1],
            });
        }

        Ok(Self {
            options,
            shape: Shape::Cumulative { sums, total },
        })
    }

    /// Create a [`Weighted`] from optional weights, uniform when `None`.
    ///
    /// # Errors
    ///
    /// See [`Weighted::new`] and [`Weighted::uniform`].
    pub fn with_weights(options: Vec<T>, weights: Option<&[f64]>) -> Result<Self, Error> {
        match weights {
            Some(weights) => Self::new(options, weights),
            None => Self::uniform(options),
        }
    }

    /// The options in their original order.
    #[must_use]
    pub fn options(&self) -> &[T] {
        &self.options
    }

    /// Choose one option.
    ///
    /// A weighted choice draws once in `[0, total)` and returns the first
    /// option whose cumulative weight exceeds the draw. Should rounding leave
    /// the draw unmatched the last option is returned.
    pub fn choose<R>(&self, rng: &mut R) -> &T
    where
        R: Rng + ?Sized,
    {
        let last = self.options.len() - 1;
        let index = match &self.shape {
            Shape::Uniform => rng.random_range(0..self.options.len()),
            Shape::Cumulative { sums, total } => {
                let draw = rng.random_range(0.0..*total);
                sums.partition_point(|&sum| sum <= draw)
            }
        };
        &self.options[index.min(last)]
    }
}
