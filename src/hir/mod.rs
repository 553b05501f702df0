//! High-level instruction graph (typed, basic-block SSA form)
//!
//! Values live in a vector arena and are addressed by handle; use lists
//! are back-references, not ownership, and the graph is the only deletion
//! authority. Every instruction with observable side effects is followed
//! by a simulate marker capturing the abstract interpreter state at that
//! point, which later becomes the deoptimization environment.

pub mod builder;
pub mod gvn;
pub mod types;

use std::fmt;

use bitflags::bitflags;

use crate::ast::{BinOp, CmpOp};
use crate::error::{Error, Result};
use types::{HType, Range, Representation};

/// Handle to a value in the graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HirId(pub u32);

impl HirId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle to a basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

impl BlockId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    /// Per-value flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HFlags: u8 {
        /// Observable side effects; must be followed by a simulate marker.
        const SIDE_EFFECTS = 1 << 0;
        /// Participates in redundancy elimination.
        const USE_GVN = 1 << 1;
        /// Integer arithmetic that may overflow 32 bits.
        const CAN_OVERFLOW = 1 << 2;
        /// May produce negative zero.
        const CAN_BE_MINUS_ZERO = 1 << 3;
        /// Calls out of the graph (needs ABI registers and a pointer map).
        const IS_CALL = 1 << 4;
        /// Removed from the graph; kept in the arena as a tombstone.
        const DELETED = 1 << 5;
    }
}

/// Constant payloads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HConst {
    Smi(i32),
    Number(f64),
    Boolean(bool),
    Undefined,
}

/// Opcode plus subtype-specific fields. Structural equality over this enum
/// is the equality GVN uses.
#[derive(Debug, Clone, PartialEq)]
pub enum HOp {
    Constant(HConst),
    Parameter(u16),
    Phi,
    Binary(BinOp),
    Compare(CmpOp),
    /// Monomorphic field access against a checked shape.
    LoadNamedField { index: u32, in_object: bool },
    StoreNamedField { index: u32, in_object: bool },
    /// Generic (IC-dispatched) property access.
    LoadNamedGeneric { name: u32 },
    StoreNamedGeneric { name: u32 },
    LoadGlobalCell { cell: u32 },
    CallKnown { function: u32, argc: u8 },
    CallNamed { name: u32, argc: u8 },
    CheckNonSmi,
    CheckMap { shape: u32 },
    /// Abstract-state snapshot; operands are the live values.
    Simulate { ast_id: u32 },
    EnterInlined { function: u32 },
    LeaveInlined,
    Goto,
    Branch,
    Return,
}

impl HOp {
    /// The flag set an instruction of this opcode starts with.
    pub fn default_flags(&self) -> HFlags {
        match self {
            HOp::Constant(_) | HOp::Compare(_) => HFlags::USE_GVN,
            HOp::Binary(op) => {
                let mut flags = HFlags::USE_GVN | HFlags::CAN_OVERFLOW;
                if matches!(op, BinOp::Mul | BinOp::Div) {
                    flags |= HFlags::CAN_BE_MINUS_ZERO;
                }
                flags
            }
            HOp::CheckNonSmi | HOp::CheckMap { .. } => HFlags::USE_GVN,
            HOp::LoadNamedGeneric { .. }
            | HOp::StoreNamedGeneric { .. }
            | HOp::CallKnown { .. }
            | HOp::CallNamed { .. } => HFlags::SIDE_EFFECTS | HFlags::IS_CALL,
            HOp::StoreNamedField { .. } => HFlags::SIDE_EFFECTS,
            _ => HFlags::empty(),
        }
    }

    /// Does this opcode end a basic block?
    pub fn is_control(&self) -> bool {
        matches!(self, HOp::Goto | HOp::Branch | HOp::Return)
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            HOp::Constant(_) => "constant",
            HOp::Parameter(_) => "parameter",
            HOp::Phi => "phi",
            HOp::Binary(BinOp::Add) => "add",
            HOp::Binary(BinOp::Sub) => "sub",
            HOp::Binary(BinOp::Mul) => "mul",
            HOp::Binary(BinOp::Div) => "div",
            HOp::Compare(_) => "compare",
            HOp::LoadNamedField { .. } => "load-named-field",
            HOp::StoreNamedField { .. } => "store-named-field",
            HOp::LoadNamedGeneric { .. } => "load-named-generic",
            HOp::StoreNamedGeneric { .. } => "store-named-generic",
            HOp::LoadGlobalCell { .. } => "load-global-cell",
            HOp::CallKnown { .. } => "call-known",
            HOp::CallNamed { .. } => "call-named",
            HOp::CheckNonSmi => "check-non-smi",
            HOp::CheckMap { .. } => "check-map",
            HOp::Simulate { .. } => "simulate",
            HOp::EnterInlined { .. } => "enter-inlined",
            HOp::LeaveInlined => "leave-inlined",
            HOp::Goto => "goto",
            HOp::Branch => "branch",
            HOp::Return => "return",
        }
    }
}

/// A use back-reference: who uses this value and at which operand index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HUse {
    pub user: HirId,
    pub index: usize,
}

/// One node of the graph.
#[derive(Debug, Clone)]
pub struct HValue {
    pub op: HOp,
    pub operands: Vec<HirId>,
    pub block: BlockId,
    pub ty: HType,
    pub rep: Representation,
    pub flags: HFlags,
    pub range: Option<Range>,
    pub uses: Vec<HUse>,
    pub position: u32,
}

impl HValue {
    pub fn is_deleted(&self) -> bool {
        self.flags.contains(HFlags::DELETED)
    }

    pub fn has_side_effects(&self) -> bool {
        self.flags.contains(HFlags::SIDE_EFFECTS)
    }
}

/// A basic block owning its phi and instruction lists.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub phis: Vec<HirId>,
    pub instructions: Vec<HirId>,
    pub predecessors: Vec<BlockId>,
    pub successors: Vec<BlockId>,
    pub dominator: Option<BlockId>,
    pub is_loop_header: bool,
}

impl Block {
    fn new(id: BlockId) -> Self {
        Self {
            id,
            phis: Vec::new(),
            instructions: Vec::new(),
            predecessors: Vec::new(),
            successors: Vec::new(),
            dominator: None,
            is_loop_header: false,
        }
    }

    /// Is the block closed by a control instruction?
    pub fn is_finished(&self, graph: &Graph) -> bool {
        self.instructions
            .last()
            .map(|&id| graph.value(id).op.is_control())
            .unwrap_or(false)
    }
}

/// The function graph: owns all blocks and values and provides the only
/// deletion authority.
#[derive(Debug)]
pub struct Graph {
    pub blocks: Vec<Block>,
    values: Vec<HValue>,
    pub entry: BlockId,
    names: Vec<String>,
}

impl Graph {
    pub fn new() -> Self {
        let entry = BlockId(0);
        Self {
            blocks: vec![Block::new(entry)],
            values: Vec::new(),
            entry,
            names: Vec::new(),
        }
    }

    // -- names -------------------------------------------------------------

    pub fn intern_name(&mut self, name: &str) -> u32 {
        if let Some(idx) = self.names.iter().position(|n| n == name) {
            return idx as u32;
        }
        self.names.push(name.to_string());
        (self.names.len() - 1) as u32
    }

    pub fn name(&self, idx: u32) -> &str {
        &self.names[idx as usize]
    }

    // -- construction ------------------------------------------------------

    pub fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block::new(id));
        id
    }

    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    pub fn value(&self, id: HirId) -> &HValue {
        &self.values[id.index()]
    }

    pub fn value_mut(&mut self, id: HirId) -> &mut HValue {
        &mut self.values[id.index()]
    }

    fn new_value(&mut self, block: BlockId, op: HOp, operands: Vec<HirId>, position: u32) -> HirId {
        let id = HirId(self.values.len() as u32);
        let flags = op.default_flags();
        self.values.push(HValue {
            op,
            operands: operands.clone(),
            block,
            ty: HType::ANY,
            rep: Representation::None,
            flags,
            range: None,
            uses: Vec::new(),
            position,
        });
        for (index, &operand) in operands.iter().enumerate() {
            self.values[operand.index()].uses.push(HUse { user: id, index });
        }
        id
    }

    /// Append an instruction to `block`.
    pub fn add_instruction(&mut self, block: BlockId, op: HOp, operands: Vec<HirId>) -> HirId {
        debug_assert!(
            !self.blocks[block.index()].is_finished(self),
            "appending to a closed block"
        );
        let id = self.new_value(block, op, operands, 0);
        self.blocks[block.index()].instructions.push(id);
        id
    }

    /// Add a phi to `block`'s phi list. Operands are per-predecessor and
    /// may be appended later as back edges are wired.
    pub fn add_phi(&mut self, block: BlockId, operands: Vec<HirId>) -> HirId {
        let id = self.new_value(block, HOp::Phi, operands, 0);
        self.blocks[block.index()].phis.push(id);
        id
    }

    /// Append `value` as an additional phi operand (back-edge wiring).
    pub fn append_phi_operand(&mut self, phi: HirId, value: HirId) {
        let index = self.values[phi.index()].operands.len();
        self.values[phi.index()].operands.push(value);
        self.values[value.index()].uses.push(HUse { user: phi, index });
    }

    fn link(&mut self, from: BlockId, to: BlockId) {
        self.blocks[from.index()].successors.push(to);
        self.blocks[to.index()].predecessors.push(from);
    }

    pub fn goto(&mut self, from: BlockId, to: BlockId) {
        self.add_instruction(from, HOp::Goto, Vec::new());
        self.link(from, to);
    }

    pub fn branch(&mut self, block: BlockId, condition: HirId, if_true: BlockId, if_false: BlockId) {
        self.add_instruction(block, HOp::Branch, vec![condition]);
        self.link(block, if_true);
        self.link(block, if_false);
    }

    // -- use-list maintenance ----------------------------------------------

    pub fn use_count(&self, id: HirId) -> usize {
        self.values[id.index()].uses.len()
    }

    /// Rewrite every use of `old` to `new`: an explicit O(uses) pass, not a
    /// pointer-identity trick.
    pub fn replace_all_uses(&mut self, old: HirId, new: HirId) {
        let uses = std::mem::take(&mut self.values[old.index()].uses);
        for huse in &uses {
            self.values[huse.user.index()].operands[huse.index] = new;
        }
        self.values[new.index()].uses.extend(uses);
    }

    /// Delete a value. The invariant "no remaining uses before deletion" is
    /// the deletion authority's contract.
    pub fn delete_from_graph(&mut self, id: HirId) {
        assert!(
            self.values[id.index()].uses.is_empty(),
            "deleting a value that still has uses"
        );
        // Unregister this value's own operand uses.
        let operands = std::mem::take(&mut self.values[id.index()].operands);
        for (index, operand) in operands.into_iter().enumerate() {
            self.values[operand.index()]
                .uses
                .retain(|u| !(u.user == id && u.index == index));
        }
        let block = self.values[id.index()].block;
        self.blocks[block.index()].instructions.retain(|&i| i != id);
        self.blocks[block.index()].phis.retain(|&i| i != id);
        self.values[id.index()].flags |= HFlags::DELETED;
    }

    // -- ordering and dominance --------------------------------------------

    /// Reverse post-order over reachable blocks.
    pub fn compute_rpo(&self) -> Vec<BlockId> {
        let mut visited = vec![false; self.blocks.len()];
        let mut post = Vec::new();
        // Iterative DFS with an explicit successor cursor.
        let mut stack: Vec<(BlockId, usize)> = vec![(self.entry, 0)];
        visited[self.entry.index()] = true;
        while let Some(&(block, cursor)) = stack.last() {
            let successors = &self.blocks[block.index()].successors;
            if cursor < successors.len() {
                stack.last_mut().unwrap().1 += 1;
                let next = successors[cursor];
                if !visited[next.index()] {
                    visited[next.index()] = true;
                    stack.push((next, 0));
                }
            } else {
                post.push(block);
                stack.pop();
            }
        }
        post.reverse();
        post
    }

    /// Fill in immediate dominators (iterative data-flow on RPO).
    pub fn compute_dominators(&mut self) {
        let rpo = self.compute_rpo();
        let mut order = vec![usize::MAX; self.blocks.len()];
        for (i, &b) in rpo.iter().enumerate() {
            order[b.index()] = i;
        }
        self.blocks[self.entry.index()].dominator = Some(self.entry);
        let mut changed = true;
        while changed {
            changed = false;
            for &b in rpo.iter().skip(1) {
                let preds: Vec<BlockId> = self.blocks[b.index()]
                    .predecessors
                    .iter()
                    .copied()
                    .filter(|p| self.blocks[p.index()].dominator.is_some())
                    .collect();
                let mut new_idom = match preds.first() {
                    Some(&p) => p,
                    None => continue,
                };
                for &p in preds.iter().skip(1) {
                    new_idom = self.intersect_doms(p, new_idom, &order);
                }
                if self.blocks[b.index()].dominator != Some(new_idom) {
                    self.blocks[b.index()].dominator = Some(new_idom);
                    changed = true;
                }
            }
        }
    }

    fn intersect_doms(&self, a: BlockId, b: BlockId, order: &[usize]) -> BlockId {
        let mut finger1 = a;
        let mut finger2 = b;
        while finger1 != finger2 {
            while order[finger1.index()] > order[finger2.index()] {
                finger1 = self.blocks[finger1.index()].dominator.unwrap();
            }
            while order[finger2.index()] > order[finger1.index()] {
                finger2 = self.blocks[finger2.index()].dominator.unwrap();
            }
        }
        finger1
    }

    /// Does `a` dominate `b`? Requires `compute_dominators` to have run.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let mut current = b;
        loop {
            if current == a {
                return true;
            }
            match self.blocks[current.index()].dominator {
                Some(idom) if idom != current => current = idom,
                _ => return false,
            }
        }
    }

    // -- verification ------------------------------------------------------

    /// Check the structural invariants: every use is dominated by its
    /// definition, and every side-effecting instruction is immediately
    /// followed by a simulate marker.
    pub fn verify(&mut self) -> Result<()> {
        self.compute_dominators();
        for block in &self.blocks {
            // Unreachable blocks carry no verified invariants.
            if block.id != self.entry && block.dominator.is_none() {
                continue;
            }
            let index_of = |id: HirId| -> Option<usize> {
                block.instructions.iter().position(|&i| i == id)
            };
            for (pos, &id) in block.instructions.iter().enumerate() {
                let value = self.value(id);
                if matches!(value.op, HOp::Phi) {
                    continue;
                }
                for &operand in &value.operands {
                    let def = self.value(operand);
                    if def.block == block.id {
                        let def_pos = index_of(operand);
                        let is_phi = self.blocks[def.block.index()].phis.contains(&operand);
                        if !is_phi {
                            match def_pos {
                                Some(dp) if dp < pos => {}
                                _ => {
                                    return Err(Error::bailout(format!(
                                        "use before definition of v{} in block {}",
                                        operand.0, block.id.0
                                    )))
                                }
                            }
                        }
                    } else if !self.dominates(def.block, block.id) {
                        return Err(Error::bailout(format!(
                            "v{} used in block {} not dominated by definition",
                            operand.0, block.id.0
                        )));
                    }
                }
                if value.has_side_effects() {
                    let next = block.instructions.get(pos + 1).map(|&n| &self.value(n).op);
                    if !matches!(next, Some(HOp::Simulate { .. })) {
                        return Err(Error::bailout(format!(
                            "side-effecting v{} not followed by simulate",
                            id.0
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    // -- analyses ----------------------------------------------------------

    /// Forward type inference over RPO.
    pub fn infer_types(&mut self) {
        let rpo = self.compute_rpo();
        for &block in &rpo {
            let work: Vec<HirId> = self.blocks[block.index()]
                .phis
                .iter()
                .chain(self.blocks[block.index()].instructions.iter())
                .copied()
                .collect();
            for id in work {
                let operand_types: Vec<HType> = self.values[id.index()]
                    .operands
                    .iter()
                    .map(|o| self.values[o.index()].ty)
                    .collect();
                let ty = Self::inferred_type(&self.values[id.index()].op, &operand_types);
                self.values[id.index()].ty = ty;
            }
        }
    }

    fn inferred_type(op: &HOp, operands: &[HType]) -> HType {
        match op {
            HOp::Constant(HConst::Smi(_)) => HType::SMI,
            HOp::Constant(HConst::Number(_)) => HType::HEAP_NUMBER,
            HOp::Constant(HConst::Boolean(_)) => HType::BOOLEAN,
            HOp::Constant(HConst::Undefined) => HType::UNDEFINED,
            HOp::Binary(_) => {
                if operands.iter().all(|t| t.is_number()) {
                    if operands.iter().all(|t| t.is_smi()) {
                        HType::SMI
                    } else {
                        HType::NUMBER
                    }
                } else {
                    HType::ANY
                }
            }
            HOp::Compare(_) => HType::BOOLEAN,
            HOp::Phi => operands
                .iter()
                .fold(HType::NONE, |acc, t| acc.combine(*t)),
            HOp::CheckNonSmi => operands
                .first()
                .copied()
                .unwrap_or(HType::ANY),
            HOp::CheckMap { .. } => HType::JS_OBJECT,
            HOp::Simulate { .. }
            | HOp::Goto
            | HOp::Branch
            | HOp::Return
            | HOp::EnterInlined { .. }
            | HOp::LeaveInlined => HType::NONE,
            _ => HType::ANY,
        }
    }

    /// Assign representations from the inferred types. Arithmetic over
    /// proven small integers lowers to 32-bit code shapes, proven numbers
    /// to doubles, everything else stays tagged.
    pub fn infer_representations(&mut self) {
        let rpo = self.compute_rpo();
        for &block in &rpo {
            let work: Vec<HirId> = self.blocks[block.index()]
                .phis
                .iter()
                .chain(self.blocks[block.index()].instructions.iter())
                .copied()
                .collect();
            for id in work {
                let rep = match &self.values[id.index()].op {
                    HOp::Constant(HConst::Smi(_)) => Representation::Integer32,
                    HOp::Constant(HConst::Number(_)) => Representation::Double,
                    HOp::Binary(_) | HOp::Compare(_) => {
                        let reps: Vec<Representation> = self.values[id.index()]
                            .operands
                            .iter()
                            .map(|o| self.values[o.index()].rep)
                            .collect();
                        if reps.iter().all(|r| *r == Representation::Integer32) {
                            Representation::Integer32
                        } else if reps
                            .iter()
                            .all(|r| matches!(r, Representation::Integer32 | Representation::Double))
                        {
                            Representation::Double
                        } else {
                            Representation::Tagged
                        }
                    }
                    HOp::Phi => {
                        let reps: Vec<Representation> = self.values[id.index()]
                            .operands
                            .iter()
                            .map(|o| self.values[o.index()].rep)
                            .collect();
                        match reps.split_first() {
                            Some((first, rest)) if rest.iter().all(|r| r == first) => *first,
                            _ => Representation::Tagged,
                        }
                    }
                    HOp::Simulate { .. }
                    | HOp::Goto
                    | HOp::Branch
                    | HOp::Return
                    | HOp::EnterInlined { .. }
                    | HOp::LeaveInlined => Representation::None,
                    _ => Representation::Tagged,
                };
                self.values[id.index()].rep = rep;
            }
        }
    }

    /// Recompute every range fact from scratch. An instruction's range is a
    /// pure function of its operands' ranges and its opcode.
    pub fn compute_ranges(&mut self) {
        for value in &mut self.values {
            value.range = None;
        }
        let rpo = self.compute_rpo();
        for &block in &rpo {
            let work: Vec<HirId> = self.blocks[block.index()]
                .phis
                .iter()
                .chain(self.blocks[block.index()].instructions.iter())
                .copied()
                .collect();
            for id in work {
                let range = self.derive_range(id);
                self.values[id.index()].range = range;
            }
        }
    }

    fn derive_range(&self, id: HirId) -> Option<Range> {
        let value = &self.values[id.index()];
        match &value.op {
            HOp::Constant(HConst::Smi(n)) => Some(Range::constant(*n)),
            HOp::Binary(op) if value.rep == Representation::Integer32 => {
                let left = self.values[value.operands[0].index()].range?;
                let right = self.values[value.operands[1].index()].range?;
                match op {
                    BinOp::Add => left.add(&right),
                    BinOp::Sub => left.sub(&right),
                    BinOp::Mul => left.mul(&right),
                    BinOp::Div => Some(Range::full()),
                }
            }
            HOp::Phi => {
                // A loop phi's back-edge operand has no range yet on the
                // first pass; without all operands there is no sound fact.
                let mut ranges = Vec::with_capacity(value.operands.len());
                for operand in &value.operands {
                    ranges.push(self.values[operand.index()].range?);
                }
                let (first, rest) = ranges.split_first()?;
                Some(rest.iter().fold(*first, |acc, r| acc.union(r)))
            }
            _ => None,
        }
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for block in &self.blocks {
            writeln!(
                f,
                "B{} preds={:?} succs={:?}",
                block.id.0,
                block.predecessors.iter().map(|b| b.0).collect::<Vec<_>>(),
                block.successors.iter().map(|b| b.0).collect::<Vec<_>>()
            )?;
            for &phi in &block.phis {
                let value = self.value(phi);
                writeln!(
                    f,
                    "  v{} = phi {:?} [{:?}]",
                    phi.0,
                    value.operands.iter().map(|o| o.0).collect::<Vec<_>>(),
                    value.ty
                )?;
            }
            for &id in &block.instructions {
                let value = self.value(id);
                writeln!(
                    f,
                    "  v{} = {} {:?} [{:?} {:?}]",
                    id.0,
                    value.op.mnemonic(),
                    value.operands.iter().map(|o| o.0).collect::<Vec<_>>(),
                    value.ty,
                    value.rep
                )?;
            }
        }
        Ok(())
    }
}
