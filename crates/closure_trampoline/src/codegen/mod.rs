use crate::{
    classify::{Layout, Strategy},
    Error, Result,
};

use dynasmrt::VecAssembler;

pub(crate) mod arch;

use arch::{Target, TargetInterface};

/// Emit the trampoline for `layout`, to be placed at address `base`.
///
/// `callable` becomes the first argument of `dispatch`, the caller's arguments follow it.
pub(crate) fn assemble(
    layout: &Layout,
    callable: *const (),
    dispatch: *const u8,
    base: usize,
) -> Result<Vec<u8>> {
    let mut ops = VecAssembler::<<Target as TargetInterface>::Relocation>::new(base);

    match layout.strategy() {
        Strategy::Registers { shifted } => {
            Target::emit_register_injection(&mut ops, shifted, callable, dispatch)
        }
        Strategy::Relocate {
            stack_words,
            displaced_slot,
        } => {
            let labels: Vec<_> = (0..Target::STACK_RELOCATION_LABELS)
                .map(|_| ops.new_dynamic_label())
                .collect();
            Target::emit_stack_relocation(
                &mut ops,
                stack_words,
                displaced_slot,
                callable,
                dispatch,
                &labels,
            )
        }
    }

    ops.finalize().map_err(Error::Assemble)
}
