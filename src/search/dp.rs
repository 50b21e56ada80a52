use crate::config::PackerConfig;
use crate::pack::PackRef;
use crate::packer::BlockState;
use crate::search::enumerate::frontier_extensions;
use crate::search::frontier::Frontier;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::rc::Rc;

/// The pack choices and cost of finishing a frontier optimally (within
/// the enumerated extension space).
pub struct DpSolution {
    pub cost: f32,
    pub packs: Vec<PackRef>,
}

/// Exhaustive alternative to MCTS: minimize over every extension pack
/// recursively, against the scalarize-everything baseline, memoized on
/// the frontier (equality is over what remains to be decided, so
/// different decision orders reaching the same residue share one entry).
pub struct DpSolver<'s, 'a> {
    state: &'s BlockState<'a>,
    config: &'s PackerConfig,
    memo: RefCell<FxHashMap<Frontier, Rc<DpSolution>>>,
}

impl<'s, 'a> DpSolver<'s, 'a> {
    pub fn new(state: &'s BlockState<'a>, config: &'s PackerConfig) -> Self {
        Self {
            state,
            config,
            memo: RefCell::new(FxHashMap::default()),
        }
    }

    pub fn solve(&self, frontier: &Frontier) -> Rc<DpSolution> {
        if frontier.is_terminal(self.state) {
            return Rc::new(DpSolution {
                cost: 0.0,
                packs: Vec::new(),
            });
        }
        if let Some(sol) = self.memo.borrow().get(frontier) {
            return Rc::clone(sol);
        }

        let mut best = Rc::new(DpSolution {
            cost: self.scalarize_everything(frontier),
            packs: Vec::new(),
        });

        for ext in frontier_extensions(self.state, frontier, self.config) {
            let (next, local) = frontier.advance_pack(self.state, &ext);
            let sub = self.solve(&next);
            let total = local + sub.cost;
            if total < best.cost {
                let mut packs = vec![Rc::clone(&ext)];
                packs.extend(sub.packs.iter().cloned());
                best = Rc::new(DpSolution { cost: total, packs });
            }
        }

        self.memo
            .borrow_mut()
            .insert(frontier.clone(), Rc::clone(&best));
        best
    }

    // Baseline: freeze the rest of the block scalar, bottom up.
    fn scalarize_everything(&self, frontier: &Frontier) -> f32 {
        let mut frontier = frontier.clone();
        let mut cost = 0.0;
        while !frontier.is_terminal(self.state) {
            let inst = frontier
                .next_usable(self.state)
                .expect("non-terminal frontier with nothing usable");
            cost += frontier.advance_inplace_inst(self.state, inst);
        }
        cost
    }

    pub fn num_memoized(&self) -> usize {
        self.memo.borrow().len()
    }
}
