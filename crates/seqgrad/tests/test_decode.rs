//! Integration tests for step-wise greedy decoding under a memory limit.

use rand::SeedableRng;
use rand::rngs::StdRng;
use seqgrad::{
    ComputeGraph, DeviceContext, DeviceId, Embedding, EngineError, FeedForward, Module, NodeRef,
    ProcessorKind, RunStatus, run_steps,
};

const VOCAB: usize = 10;
const DIM: usize = 16;

struct Decoder {
    embed: Module,
    project: Module,
}

impl Decoder {
    fn new(ctx: &DeviceContext) -> Self {
        let mut rng = StdRng::seed_from_u64(21);
        Self {
            embed: Embedding::new("embed", VOCAB, DIM, ctx, &mut rng).unwrap().into(),
            project: FeedForward::new("project", DIM, VOCAB, None, ctx, &mut rng)
                .unwrap()
                .into(),
        }
    }

    /// Embedding of `token` and the greedy next token.
    fn step(&self, g: &mut ComputeGraph, token: usize) -> Result<(NodeRef, usize), EngineError> {
        let tokens = [token];
        let e = self.embed.forward(g, &tokens[..])?;
        let logits = self.project.forward(g, e)?;
        let probs = g.softmax(logits)?;
        let p = g.value(probs)?.to_vec()?;
        let next = p
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map_or(0, |(i, _)| i);
        Ok((e, next))
    }
}

#[test]
fn test_decode_runs_to_completion_in_bounded_memory() {
    let ctx = DeviceContext::cpu();
    let decoder = Decoder::new(&ctx);
    let mut g = ComputeGraph::new(&ctx, false);

    let mut token = 1;
    let mut reserved = Vec::new();
    let report = run_steps(&mut g, 20, |g, _| {
        let (_, next) = decoder.step(g, token)?;
        token = next;
        reserved.push(g.device().allocator().stats().bytes_reserved);
        Ok(Some(next))
    })
    .unwrap();

    assert!(report.is_complete());
    assert_eq!(report.steps(), 20);
    assert!(report.outputs.iter().all(|&t| t < VOCAB));
    assert!(reserved.windows(2).skip(1).all(|w| w[0] == w[1]));
    assert_eq!(g.live_nodes(), 0);
}

#[test]
fn test_out_of_memory_returns_completed_prefix() {
    let _ = env_logger::builder().is_test(true).try_init();
    let ctx = DeviceContext::new(DeviceId(0), ProcessorKind::Accelerator, Some(64 * 1024));
    let decoder = Decoder::new(&ctx);
    let mut g = ComputeGraph::new(&ctx, false);

    // Every step keeps a longer copy of the embedding history alive.
    let mut token = 1;
    let mut history: Option<NodeRef> = None;
    let mut kept = Vec::new();
    let report = run_steps(&mut g, 500, |g, _| {
        let (e, next) = decoder.step(g, token)?;
        let grown = match history {
            Some(h) => g.concat(&[h, e], 0)?,
            None => g.mul_scalar(e, 1.0)?,
        };
        g.unbind(grown)?;
        kept.push(grown);
        history = Some(grown);
        token = next;
        Ok(Some(next))
    })
    .unwrap();

    let RunStatus::OutOfMemory { step } = report.status else {
        panic!("expected the pool to run out, got {:?}", report.status);
    };
    assert!(step > 10);
    assert_eq!(report.steps(), step);
    assert_eq!(kept.len(), step);
    let last = *kept.last().unwrap();
    assert_eq!(g.shape(last).unwrap(), vec![step, DIM]);

    // Dropping the history makes room for a fresh run.
    for node in kept {
        g.dispose(node).unwrap();
    }
    let mut token = 1;
    let retry = run_steps(&mut g, 5, |g, _| {
        let (_, next) = decoder.step(g, token)?;
        token = next;
        Ok(Some(next))
    })
    .unwrap();
    assert!(retry.is_complete());
    assert_eq!(retry.outputs, report.outputs[..5].to_vec());
}
