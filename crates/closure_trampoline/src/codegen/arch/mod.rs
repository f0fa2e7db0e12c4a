use dynasmrt::{relocations, DynamicLabel, DynasmApi, DynasmLabelApi};

#[cfg(all(target_arch = "x86_64", unix))]
mod x86_64;
#[cfg(all(target_arch = "x86_64", unix))]
pub use x86_64::Target;

#[cfg(not(all(target_arch = "x86_64", unix)))]
compile_error!("closure_trampoline only supports the System V AMD64 calling convention");

/// Everything that depends on the instruction set and calling convention.
///
/// Classification only reads the register counts, and code generation only goes through the two
/// emit functions, so another target is added by implementing this trait.
pub trait TargetInterface {
    /// Relocation kind of the target's assembler.
    type Relocation: relocations::Relocation;

    /// Integer argument registers, in argument order.
    const INTEGER_ARG_REGISTERS: usize;
    /// Floating point argument registers, in argument order.
    const FLOAT_ARG_REGISTERS: usize;
    /// Size of one stack argument slot.
    const WORD_SIZE: usize;
    /// Dynamic labels [`emit_stack_relocation`](Self::emit_stack_relocation) expects.
    const STACK_RELOCATION_LABELS: usize;

    /// Shift the first `shifted` integer arguments one register down, load `callable` into the
    /// first argument register and tail-jump to `dispatch`.
    fn emit_register_injection<A: DynasmApi>(
        ops: &mut A,
        shifted: usize,
        callable: *const (),
        dispatch: *const u8,
    );

    /// Shift every integer argument register, move the displaced last register into the stack
    /// arguments after `displaced_slot` of the caller's `stack_words`, call `dispatch` with
    /// `callable` as first argument and return to the caller.
    ///
    /// `labels` are fresh labels allocated by the owning assembler.
    fn emit_stack_relocation<A: DynasmLabelApi<Relocation = Self::Relocation>>(
        ops: &mut A,
        stack_words: usize,
        displaced_slot: usize,
        callable: *const (),
        dispatch: *const u8,
        labels: &[DynamicLabel],
    );
}
