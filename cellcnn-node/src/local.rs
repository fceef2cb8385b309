//! In-process federation: every party runs as a tokio task on one tree of
//! channels.

use std::sync::Arc;

use anyhow::Context;
use cellcnn::rng::party_rng;
use cellcnn::{CellCnn, CnnConfig, ConfigError, Result, Sample};
use cellcnn_ckks::CkksScheme;
use log::info;
use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::keys::collective_setup;
use crate::session::{Party, TrainingReport};
use crate::transport::{tree, DoneSignal};

type PartyResult = crate::error::Result<Option<TrainingReport>>;

pub struct Federation {
    handles: Vec<(usize, JoinHandle<PartyResult>)>,
    done: DoneSignal,
}

impl Federation {
    /// Validate everything, run the collective key setup and spawn one task
    /// per party. Nothing is generated or spawned when validation fails.
    /// Must be called from within a tokio runtime.
    pub fn start<S: CkksScheme + 'static>(
        scheme: S,
        cnn: CnnConfig,
        session: SessionConfig,
        shards: Vec<Vec<Sample>>,
    ) -> Result<Self> {
        cnn.validate()?;
        session.validate()?;
        check_shards(&cnn, &session, &shards)?;

        let (ctx, sk) = collective_setup(scheme, &cnn, session.parties)?;
        let ctx = Arc::new(ctx);
        let (endpoints, done) = tree(session.parties, session.fan_out);

        let mut parties = Vec::with_capacity(session.parties);
        for (endpoint, shard) in endpoints.into_iter().zip(shards) {
            let model = CellCnn::new(cnn.clone(), Arc::clone(&ctx), party_rng(&cnn, endpoint.id))?;
            parties.push(Party::new(model, shard, endpoint, sk.clone(), session.clone())?);
        }

        info!(
            "starting federation: {} parties, fan-out {}, {} iterations",
            session.parties,
            session.fan_out,
            cnn.max_iterations()
        );
        let handles = parties
            .into_iter()
            .map(|party| {
                let id = party.id();
                let done = done.clone();
                let handle = tokio::spawn(async move {
                    let result = party.run().await;
                    // one abort stops the whole tree
                    if result.is_err() {
                        done.cancel();
                    }
                    result
                });
                (id, handle)
            })
            .collect();
        Ok(Self { handles, done })
    }

    /// Raise the done signal; every party returns at its next receive.
    pub fn cancel(&self) {
        self.done.cancel();
    }

    /// Wait for every party. Returns the root's report, or the first
    /// abort that was not itself caused by cancellation.
    pub async fn wait(self) -> anyhow::Result<TrainingReport> {
        let mut report = None;
        let mut failure: Option<(usize, SessionError)> = None;
        for (id, handle) in self.handles {
            let result = handle.await.with_context(|| format!("party {} task failed", id))?;
            match result {
                Ok(Some(r)) => report = Some(r),
                Ok(None) => {}
                Err(e) => {
                    let replace = match &failure {
                        None => true,
                        Some((_, SessionError::Cancelled)) => !matches!(e, SessionError::Cancelled),
                        Some(_) => false,
                    };
                    if replace {
                        failure = Some((id, e));
                    }
                }
            }
        }
        if let Some((id, e)) = failure {
            return Err(anyhow::Error::new(e).context(format!("party {} aborted", id)));
        }
        report.context("root finished without a report")
    }
}

fn check_shards(
    cnn: &CnnConfig,
    session: &SessionConfig,
    shards: &[Vec<Sample>],
) -> std::result::Result<(), ConfigError> {
    if cnn.n_parties != session.parties {
        return Err(ConfigError::OutOfRange {
            field: "n_parties",
            detail: format!("{} in the model, {} in the session", cnn.n_parties, session.parties),
        });
    }
    if shards.len() != session.parties {
        return Err(ConfigError::OutOfRange {
            field: "shards",
            detail: format!("{} shards for {} parties", shards.len(), session.parties),
        });
    }
    for (party, shard) in shards.iter().enumerate() {
        if shard.is_empty() {
            return Err(ConfigError::OutOfRange {
                field: "shards",
                detail: format!("party {} holds no samples", party),
            });
        }
        let bad = shard
            .iter()
            .find(|s| s.x.cols != cnn.features || s.y.shape() != (1, cnn.classes));
        if let Some(s) = bad {
            return Err(ConfigError::OutOfRange {
                field: "shards",
                detail: format!(
                    "party {} holds a sample of shape {:?} with label {:?}",
                    party,
                    s.x.shape(),
                    s.y.shape()
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellcnn::dataset::one_hot;
    use cellcnn::Matrix;

    fn config() -> CnnConfig {
        CnnConfig {
            cells: 2,
            features: 4,
            filters: 2,
            classes: 2,
            batch_size: 2,
            samples: 1,
            n_parties: 2,
            ..CnnConfig::default()
        }
    }

    fn sample(features: usize) -> Sample {
        Sample {
            x: Matrix::zeros(2, features),
            y: one_hot(1, 2),
        }
    }

    #[test]
    fn shard_checks() {
        let session = SessionConfig {
            parties: 2,
            ..SessionConfig::default()
        };
        let good = vec![vec![sample(4)], vec![sample(4)]];
        assert!(check_shards(&config(), &session, &good).is_ok());
        assert!(check_shards(&config(), &session, &good[..1]).is_err());
        assert!(check_shards(&config(), &session, &[vec![sample(4)], vec![]]).is_err());
        assert!(check_shards(&config(), &session, &[vec![sample(4)], vec![sample(6)]]).is_err());

        let solo = CnnConfig {
            n_parties: 1,
            ..config()
        };
        assert!(matches!(
            check_shards(&solo, &session, &good),
            Err(ConfigError::OutOfRange { field: "n_parties", .. })
        ));
    }
}
