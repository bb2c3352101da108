//! The greedy-descent search driver.

use std::path::Path;

use tracing::debug;
use tracing::info;

use crate::Environment;
use crate::Result;
use crate::State;
use crate::SuccessorGenerator;

/// Minimizes *initial* by greedy descent over the generator pipeline.
///
/// The driver asks the current generator for successors of the current
/// state, chunks the lazy stream into batches of the environment's batch
/// size, and runs each batch through the environment's submit → wait →
/// collect cycle. As soon as a batch produces an improving successor the
/// search commits to it: the successor's state becomes the current state
/// and the pipeline restarts at the first generator, so generators earlier
/// in the pipeline are preferred for repeated application. When a full pass
/// of a generator yields no improvement, the search moves on to the next
/// generator; it terminates once no generator improves the current state.
///
/// The returned state is the minimization result. Writing it back into a
/// domain-appropriate format is the caller's responsibility, as is keeping
/// the property of interest checkable by *evaluator* (see
/// [`evaluate`](crate::evaluate) for the contract).
pub async fn search<S, E>(
    initial: S,
    generators: &[Box<dyn SuccessorGenerator<S>>],
    evaluator: &Path,
    environment: &mut E,
) -> Result<S>
where
    S: State,
    E: Environment<S> + ?Sized,
{
    let batch_size = environment.batch_size();
    let mut current = initial;
    let mut index = 0;

    while index < generators.len() {
        debug!("generating successors with generator {index}");

        let mut improved = None;
        {
            let mut stream = generators[index].successors(&current);
            loop {
                let batch: Vec<_> = stream.by_ref().take(batch_size).collect();
                if batch.is_empty() {
                    break;
                }

                debug!(
                    "submitting a batch of {len} successor{s}",
                    len = batch.len(),
                    s = if batch.len() == 1 { "" } else { "s" }
                );
                environment.submit(batch, evaluator).await?;
                environment.wait_until_finished().await?;

                if let Some(winner) = environment.get_improving_successor().await? {
                    improved = Some(winner);
                    break;
                }
            }
        }

        match improved {
            Some(winner) => {
                info!(
                    "committing to improving successor: {change}",
                    change = winner.change
                );
                current = winner.state;
                index = 0;
            }
            None => {
                debug!("generator {index} was exhausted without improvement");
                index += 1;
            }
        }
    }

    info!("search finished; no generator improves the current state");
    Ok(current)
}
