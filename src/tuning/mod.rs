//! Adaptive tuning of the tier-bypass migration policy (spec.md §4.7).
//!
//! Grounded on `examples/original_source/include/benchmark/minimizer.h`'s
//! free-function `SimulatedAnnealing`/`GradientDescent` declarations and
//! `src/benchmark/minimizer.cpp`'s bodies. Kept as free functions taking
//! callbacks rather than a struct, matching the original: the caller owns
//! the policy, the workload, and the cost model, and hands this module
//! only `set_policy`/`cost` seams plus (for annealing) a `neighbor`
//! callback.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::buffer::migration::PolicySnapshot;

const INITIAL_TEMPERATURE: f64 = 800.0;
const MIN_TEMPERATURE: f64 = 0.00008;
const COOLING_FACTOR: f64 = 0.9;
const STATE_COUNT: u32 = 15;
const NEIGHBOR_DELTA: f64 = 0.05;

/// Perturbs one of the four knobs (Dr, Dw, Nr, Nw) by `±NEIGHBOR_DELTA`
/// with probability ¼ each, clamped to `[0.01, 1]`.
pub fn neighbor(policy: PolicySnapshot, rng: &mut impl Rng) -> PolicySnapshot {
    let mut p = policy;
    let delta = if rng.random_bool(0.5) {
        NEIGHBOR_DELTA
    } else {
        -NEIGHBOR_DELTA
    };
    let clamp = |x: f64| x.clamp(0.01, 1.0);
    match rng.random_range(0..4u8) {
        0 => p.dr = clamp(p.dr + delta),
        1 => p.dw = clamp(p.dw + delta),
        2 => p.nr = clamp(p.nr + delta),
        _ => p.nw = clamp(p.nw + delta),
    }
    p
}

/// Single-threaded simulated annealing driver. Tries a neighboring
/// configuration on every iteration, accepting it outright when it lowers
/// `cost()` and otherwise with probability `exp(-ΔE/T)`; the temperature
/// cools by [`COOLING_FACTOR`] every [`STATE_COUNT`] iterations. Runs
/// until `duration` elapses or the temperature drops below
/// [`MIN_TEMPERATURE`], whichever comes first. Every configuration tried
/// — accepted or not — is pushed through `set_policy` before `cost` is
/// called, so the caller always measures the configuration currently in
/// effect.
pub fn simulated_annealing(
    duration: Duration,
    initial: PolicySnapshot,
    mut set_policy: impl FnMut(PolicySnapshot),
    mut cost: impl FnMut() -> f64,
    mut rng: impl Rng,
) -> PolicySnapshot {
    let deadline = Instant::now() + duration;
    let mut temperature = INITIAL_TEMPERATURE;
    let mut current = initial;
    let mut state_itr = 0u32;

    set_policy(current);
    let mut energy = cost();

    while temperature > MIN_TEMPERATURE && Instant::now() < deadline {
        let candidate = neighbor(current, &mut rng);
        set_policy(candidate);
        let new_energy = cost();
        let energy_delta = new_energy - energy;

        let accept = if energy_delta < 0.0 {
            true
        } else {
            let acceptance_probability = (-energy_delta / temperature).exp();
            rng.random::<f64>() <= acceptance_probability
        };

        if accept {
            tracing::debug!(energy_delta, accept = true, "annealing step");
            current = candidate;
            energy = new_energy;
        } else {
            tracing::debug!(energy_delta, accept = false, "annealing step");
            set_policy(current);
        }

        state_itr += 1;
        if state_itr >= STATE_COUNT {
            temperature *= COOLING_FACTOR;
            state_itr = 0;
            tracing::debug!(temperature, "cooling");
        }
    }

    current
}

const GRADIENT_LEARNING_RATE: f64 = 0.35;
const GRADIENT_PROBE_DELTA: f64 = -0.5;

fn knob(p: &PolicySnapshot, idx: usize) -> f64 {
    match idx {
        0 => p.dr,
        1 => p.dw,
        2 => p.nr,
        _ => p.nw,
    }
}

fn with_knob(mut p: PolicySnapshot, idx: usize, v: f64) -> PolicySnapshot {
    match idx {
        0 => p.dr = v,
        1 => p.dw = v,
        2 => p.nr = v,
        _ => p.nw = v,
    }
    p
}

/// Coordinate-wise gradient descent, the original's alternative to
/// annealing: each round probes all four knobs one at a time (a large
/// fixed perturbation, not a small step), estimates a gradient from the
/// resulting cost delta, then moves every knob by `-learning_rate *
/// gradient` simultaneously. Runs until `duration` elapses.
pub fn gradient_descent(
    duration: Duration,
    initial: PolicySnapshot,
    mut set_policy: impl FnMut(PolicySnapshot),
    mut cost: impl FnMut() -> f64,
) -> PolicySnapshot {
    let deadline = Instant::now() + duration;
    let mut current = initial;
    let cap = |x: f64| x.clamp(0.0, 1.0);

    while Instant::now() < deadline {
        set_policy(current);
        let base_cost = cost();

        let mut gradients = [0.0f64; 4];
        for (idx, g) in gradients.iter_mut().enumerate() {
            let probed_value = cap(knob(&current, idx) + GRADIENT_PROBE_DELTA);
            let probe = with_knob(current, idx, probed_value);
            set_policy(probe);
            let probe_cost = cost();
            *g = (probe_cost - base_cost) / GRADIENT_PROBE_DELTA;
        }

        current = PolicySnapshot {
            dr: cap(current.dr - GRADIENT_LEARNING_RATE * gradients[0]),
            dw: cap(current.dw - GRADIENT_LEARNING_RATE * gradients[1]),
            nr: cap(current.nr - GRADIENT_LEARNING_RATE * gradients[2]),
            nw: cap(current.nw - GRADIENT_LEARNING_RATE * gradients[3]),
        };
        tracing::debug!(?current, base_cost, "gradient descent round");
    }

    set_policy(current);
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    /// A cost surface with a single minimum at dr=0.3, everything else
    /// pinned at 0 so the search only needs to move one knob.
    fn bowl_cost(p: &PolicySnapshot) -> f64 {
        (p.dr - 0.3).powi(2) + p.dw.powi(2) + p.nr.powi(2) + p.nw.powi(2)
    }

    #[test]
    fn neighbor_changes_exactly_one_knob_and_stays_in_bounds() {
        let mut rng = StdRng::seed_from_u64(42);
        let base = PolicySnapshot { dr: 0.5, dw: 0.5, nr: 0.5, nw: 0.5 };
        let next = neighbor(base, &mut rng);
        let changed = [
            next.dr != base.dr,
            next.dw != base.dw,
            next.nr != base.nr,
            next.nw != base.nw,
        ]
        .iter()
        .filter(|&&c| c)
        .count();
        assert_eq!(changed, 1);
        assert!(next.dr >= 0.01 && next.dr <= 1.0);
        assert!(next.dw >= 0.01 && next.dw <= 1.0);
        assert!(next.nr >= 0.01 && next.nr <= 1.0);
        assert!(next.nw >= 0.01 && next.nw <= 1.0);
    }

    #[test]
    fn simulated_annealing_reduces_cost_on_a_simple_bowl() {
        let rng = StdRng::seed_from_u64(7);
        let initial = PolicySnapshot { dr: 0.9, dw: 0.0, nr: 0.0, nw: 0.0 };
        let initial_cost = bowl_cost(&initial);

        let last_policy = std::cell::RefCell::new(initial);
        let result = simulated_annealing(
            Duration::from_millis(200),
            initial,
            |p| *last_policy.borrow_mut() = p,
            || bowl_cost(&last_policy.borrow()),
            rng,
        );

        assert!(bowl_cost(&result) <= initial_cost);
    }

    #[test]
    fn gradient_descent_moves_toward_the_minimum() {
        let initial = PolicySnapshot { dr: 0.9, dw: 0.0, nr: 0.0, nw: 0.0 };
        let initial_cost = bowl_cost(&initial);

        let last_policy = std::cell::RefCell::new(initial);
        let result = gradient_descent(
            Duration::from_millis(150),
            initial,
            |p| *last_policy.borrow_mut() = p,
            || bowl_cost(&last_policy.borrow()),
        );

        assert!(bowl_cost(&result) <= initial_cost);
    }
}
