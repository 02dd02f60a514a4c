//! Single-process demonstration run.
//!
//! Spins up the rendezvous server on an ephemeral port, partitions a
//! synthetic data matrix across peer threads, runs the function party on
//! the calling thread, and verifies the assembled Gram matrix against the
//! direct product of the unpartitioned data.

use std::thread;

use anyhow::Context;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha20Rng;
use shroud_core::outlier::KnnOutlierDetection;
use shroud_core::{FunctionParty, Matrix, PeerEngine, PeerHooks, ProtocolConfig, FP_ID};
use tracing::info;

use crate::config::TransportConfig;
use crate::mailbox_client::TcpMailbox;
use crate::rendezvous::Rendezvous;

/// Hooks for a peer whose labels are fixed up front (demo partitions,
/// CSV-loaded label columns).
pub struct StaticLabels {
    pub labels: Option<Vec<f64>>,
}

impl PeerHooks for StaticLabels {
    fn labels(&self) -> Option<Vec<f64>> {
        self.labels.clone()
    }
}

pub struct DemoOptions {
    pub peers: usize,
    pub samples: usize,
    pub features: usize,
    pub labels: bool,
    pub outlier_k: Option<usize>,
    pub seed: u64,
}

pub fn run(opts: &DemoOptions) -> anyhow::Result<Matrix> {
    anyhow::ensure!(opts.peers >= 1, "need at least one peer");
    anyhow::ensure!(
        opts.samples >= opts.peers,
        "need at least one sample per peer"
    );

    let peer_ids: Vec<String> = (1..=opts.peers).map(|i| format!("client_{i}")).collect();

    let runtime = tokio::runtime::Runtime::new()?;
    let rendezvous = runtime.block_on(Rendezvous::bind("127.0.0.1:0".parse()?, &peer_ids))?;
    let addr = rendezvous.local_addr()?;
    let server = runtime.spawn(rendezvous.serve());

    let mut rng = ChaCha20Rng::seed_from_u64(opts.seed);
    let data = Matrix::sample_uniform(opts.samples, opts.features, -3.0, 3.0, &mut rng);
    let labels: Vec<f64> = (0..opts.samples).map(|i| (i % 2) as f64).collect();

    // Contiguous row ranges per peer, the remainder going to the last one.
    let mut cuts: Vec<usize> = (0..opts.peers)
        .map(|i| opts.samples / opts.peers * i)
        .collect();
    cuts.push(opts.samples);

    let transport = TransportConfig::default();
    let protocol = ProtocolConfig {
        timeout_secs: 0.5,
        ..Default::default()
    };

    let mut handles = Vec::new();
    for (i, id) in peer_ids.iter().enumerate() {
        let block = data.row_slice(cuts[i], cuts[i + 1]);
        let peer_labels = opts.labels.then(|| labels[cuts[i]..cuts[i + 1]].to_vec());
        let id = id.clone();
        let transport = transport.clone();
        let protocol = protocol.clone();
        handles.push(thread::spawn(move || -> anyhow::Result<()> {
            let mailbox = TcpMailbox::connect(&id, addr, &transport)?;
            let others: Vec<String> = mailbox
                .input_peers()
                .into_iter()
                .filter(|p| *p != id)
                .collect();
            let mut engine = PeerEngine::new(
                &id,
                others,
                block,
                protocol,
                mailbox,
                StaticLabels {
                    labels: peer_labels,
                },
            )?;
            engine.run()?;
            Ok(())
        }));
    }

    let fp_mailbox = TcpMailbox::connect(FP_ID, addr, &transport)?;
    let mut fp = FunctionParty::new(peer_ids, protocol, fp_mailbox, ())?;
    fp.run(opts.labels)?;
    let gram = fp.gram_matrix()?;

    if opts.labels {
        let collected = fp.labels_concatenated().context("label parts missing")?;
        anyhow::ensure!(
            collected == labels,
            "collected labels do not match the partition"
        );
        info!(count = collected.len(), "labels collected");
    }

    drop(fp);
    for handle in handles {
        handle
            .join()
            .map_err(|_| anyhow::anyhow!("peer thread panicked"))??;
    }
    runtime.block_on(server)??;

    let expected = data.matmul_nt(&data);
    anyhow::ensure!(
        gram.allclose(&expected, 1e-6, 1e-6),
        "assembled matrix does not match the direct product"
    );
    info!(
        rows = gram.rows(),
        peers = opts.peers,
        "assembled gram matrix verified against the direct product"
    );

    if let Some(k) = opts.outlier_k {
        report_outliers(&gram, k);
    }
    Ok(gram)
}

fn report_outliers(gram: &Matrix, k: usize) {
    let detector = KnnOutlierDetection::new(gram);
    let scores = detector.knn_weighted_score(k);
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    let top: Vec<(usize, f64)> = order.into_iter().take(5).map(|i| (i, scores[i])).collect();
    info!(?top, k, "most outlying samples by weighted k-NN distance");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_round_trips_over_real_sockets() {
        let opts = DemoOptions {
            peers: 2,
            samples: 6,
            features: 2,
            labels: true,
            outlier_k: None,
            seed: 11,
        };
        // `run` verifies the matrix against the direct product internally.
        let gram = run(&opts).expect("demo run");
        assert_eq!(gram.shape(), (6, 6));
    }
}
