/// One entry of a context's conditional stack.
///
/// `ran_if_block` is set as soon as any branch of the `if`/`elif`/`else` chain has
/// been taken; subsequent branches must then be skipped. `reached_else_block`
/// guards against a second `else` in the same chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct IfFrame {
    pub ran_if_block: bool,
    pub reached_else_block: bool,
}
