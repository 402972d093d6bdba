//! Gives every natural loop a dedicated preheader.

use crate::analysis::LoopInfo;
use crate::il;
use crate::Error;
use std::collections::BTreeSet;

/// Insert a preheader in front of every loop header which lacks one, and
/// return the number of preheaders created.
///
/// Loops whose header has no predecessor outside the loop, such as a loop
/// headed by the entry block, are left alone.
pub fn loop_simplify(function: &mut il::Function) -> Result<usize, Error> {
    let mut inserted = 0;
    let mut skipped: BTreeSet<usize> = BTreeSet::new();

    loop {
        let cfg = function.control_flow_graph_mut()?;
        let loop_info = LoopInfo::new(cfg)?;

        let candidate = loop_info
            .loops()
            .into_iter()
            .find(|l| l.preheader().is_none() && !skipped.contains(&l.header()))
            .map(|l| (l.header(), l.blocks().clone()));

        let (header, blocks) = match candidate {
            Some(candidate) => candidate,
            None => break,
        };

        let outside: Vec<usize> = cfg
            .predecessor_indices(header)?
            .into_iter()
            .filter(|predecessor| !blocks.contains(predecessor))
            .collect();
        if outside.is_empty() {
            warn!("loop at 0x{:X} has no entering block", header);
            skipped.insert(header);
            continue;
        }

        let preheader = insert_preheader(cfg, header, &outside)?;
        debug!(
            "inserted preheader 0x{:X} for loop at 0x{:X}",
            preheader, header
        );
        inserted += 1;
    }

    Ok(inserted)
}

fn insert_preheader(
    cfg: &mut il::ControlFlowGraph,
    header: usize,
    outside: &[usize],
) -> Result<usize, Error> {
    let preheader = cfg.new_block()?.index();

    for predecessor in outside {
        cfg.redirect_edge(*predecessor, header, preheader)?;
    }
    cfg.unconditional_edge(preheader, header)?;

    // Incoming values from the old predecessors now arrive through the
    // preheader, merged there by a new phi when they disagree.
    let phis: Vec<(usize, il::Variable, Vec<(il::Value, usize)>)> = cfg
        .block(header)?
        .instructions()
        .iter()
        .filter_map(|instruction| match instruction.operation() {
            il::Operation::Phi { dst, incoming } => {
                Some((instruction.index(), dst.clone(), incoming.clone()))
            }
            _ => None,
        })
        .collect();

    for (index, dst, incoming) in phis {
        let (entering, staying): (Vec<(il::Value, usize)>, Vec<(il::Value, usize)>) = incoming
            .into_iter()
            .partition(|(_, block)| outside.contains(block));

        let merged = match entering.as_slice() {
            [] => continue,
            [(value, _)] => value.clone(),
            [(first, _), rest @ ..] if rest.iter().all(|(value, _)| value == first) => {
                first.clone()
            }
            _ => {
                let temp = cfg.temp(dst.ty().clone());
                let block = cfg.block_mut(preheader)?;
                let position = block.first_non_phi_position();
                block.insert_operation(
                    position,
                    il::Operation::Phi {
                        dst: temp.clone(),
                        incoming: entering,
                    },
                )?;
                il::Value::Variable(temp)
            }
        };

        let mut incoming = staying;
        incoming.push((merged, preheader));
        if let il::Operation::Phi {
            incoming: phi_incoming,
            ..
        } = cfg.block_mut(header)?.instruction_mut(index)?.operation_mut()
        {
            *phi_incoming = incoming;
        }
    }

    Ok(preheader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::*;

    /// 0 -> 2, 1 -> 2 (0 -> 1 too), 2 -> 2, 2 -> 3
    fn two_entries() -> Function {
        let mut cfg = ControlFlowGraph::new();
        let a = {
            let block = cfg.new_block().unwrap();
            block.compare(int("c", 1), ComparePredicate::Eq, const_(0, 64), const_(0, 64));
            block.index()
        };
        let b = {
            let block = cfg.new_block().unwrap();
            block.nop();
            block.index()
        };
        let header = {
            let block = cfg.new_block().unwrap();
            block.phi(
                int("i", 64),
                vec![
                    (const_(0, 64), a),
                    (const_(5, 64), b),
                    (val_int("i.next", 64), 2),
                ],
            );
            block.binary(int("i.next", 64), BinaryOperator::Add, val_int("i", 64), const_(1, 64));
            block.compare(int("d", 1), ComparePredicate::Slt, val_int("i.next", 64), const_(9, 64));
            block.index()
        };
        let exit = {
            let block = cfg.new_block().unwrap();
            block.ret(None);
            block.index()
        };
        cfg.set_entry(a).unwrap();
        cfg.conditional_edge(a, b, Condition::True(val_int("c", 1)))
            .unwrap();
        cfg.conditional_edge(a, header, Condition::False(val_int("c", 1)))
            .unwrap();
        cfg.unconditional_edge(b, header).unwrap();
        cfg.conditional_edge(header, header, Condition::True(val_int("d", 1)))
            .unwrap();
        cfg.conditional_edge(header, exit, Condition::False(val_int("d", 1)))
            .unwrap();
        Function::new("f", vec![], Type::Void, cfg)
    }

    #[test]
    fn inserts_preheader_and_merges_phis() {
        let mut function = two_entries();

        assert_eq!(loop_simplify(&mut function).unwrap(), 1);

        let cfg = function.control_flow_graph().unwrap();
        let loop_info = LoopInfo::new(cfg).unwrap();
        let l = loop_info.loop_with_header(2).unwrap();
        let preheader = l.preheader().unwrap();
        assert_eq!(preheader, 4);

        // The conditional edge keeps its condition on its new tail.
        assert_eq!(
            cfg.edge(0, preheader).unwrap().condition(),
            Some(&Condition::False(val_int("c", 1)))
        );

        let merged = &cfg.block(preheader).unwrap().instructions()[0];
        assert!(merged.operation().is_phi());
        match cfg.block(2).unwrap().instructions()[0].operation() {
            Operation::Phi { incoming, .. } => {
                assert_eq!(incoming.len(), 2);
                assert_eq!(incoming[1].1, preheader);
                assert_eq!(
                    incoming[1].0,
                    Value::Variable(merged.variable_written().unwrap().clone())
                );
            }
            _ => panic!("expected a phi"),
        }

        // A second run changes nothing.
        assert_eq!(loop_simplify(&mut function).unwrap(), 0);
    }
}
