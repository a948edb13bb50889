//! Graphviz rendering of lifted functions, one node per basic block

use crate::ir::{BlockId, FuncId, Module, Terminator};

type Node = BlockId;
type Edge = (Node, Node, String);

struct Graph<'a> {
    module: &'a Module,
    func: FuncId,
}

impl<'a> Graph<'a> {
    fn edges_of(&self) -> Vec<Edge> {
        let f = self.module.function(self.func);
        let mut edges: Vec<Edge> = vec![];
        for &b in f.blocks() {
            match f.terminator(b) {
                Some(Terminator::Br(t)) => edges.push((b, *t, String::new())),
                Some(Terminator::CondBr {
                    then_bb, else_bb, ..
                }) => {
                    edges.push((b, *then_bb, "true".into()));
                    edges.push((b, *else_bb, "false".into()));
                }
                Some(Terminator::Switch { default, cases, .. }) => {
                    edges.push((b, *default, "default".into()));
                    for (v, t) in cases {
                        edges.push((b, *t, format!("{:#x}", v)));
                    }
                }
                Some(Terminator::Ret(_)) | Some(Terminator::Unreachable) | None => {}
            }
        }
        edges
    }
}

impl<'a> dot::Labeller<'a, Node, Edge> for Graph<'a> {
    fn graph_id(&'a self) -> dot::Id<'a> {
        dot::Id::new("LiftedFunction").unwrap()
    }
    fn node_id(&'a self, n: &Node) -> dot::Id<'a> {
        dot::Id::new(format!("bb{}", n.0)).unwrap()
    }
    fn node_label<'b>(&'b self, n: &Node) -> dot::LabelText<'b> {
        let f = self.module.function(self.func);
        let listing = self.module.debug_function(self.func).block_listing(*n);
        dot::LabelText::escaped(format!(
            "{}:\\l{}",
            f.block_name(*n),
            listing
                .replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('\n', "\\l")
        ))
    }
    fn node_shape(&'a self, _n: &Node) -> Option<dot::LabelText<'a>> {
        Some(dot::LabelText::label("box"))
    }
    fn edge_label<'b>(&'b self, e: &Edge) -> dot::LabelText<'b> {
        dot::LabelText::label(e.2.clone())
    }
}

impl<'a> dot::GraphWalk<'a, Node, Edge> for Graph<'a> {
    fn nodes(&self) -> dot::Nodes<'a, Node> {
        self.module.function(self.func).blocks().to_vec().into()
    }
    fn edges(&'a self) -> dot::Edges<'a, Edge> {
        self.edges_of().into()
    }
    fn source(&self, e: &Edge) -> Node {
        e.0
    }
    fn target(&self, e: &Edge) -> Node {
        e.1
    }
}

/// Write the control flow graph of `func` as a `.dot` file, each block labelled with its
/// instruction listing
pub fn render_function<W: std::io::Write>(
    module: &Module,
    func: FuncId,
    w: &mut W,
) -> std::io::Result<()> {
    let g = Graph { module, func };
    dot::render(&g, w)
}

/// Generate a `.dot` file representing the control flow graph of `func`
pub fn generate_dot(module: &Module, func: FuncId) -> String {
    let mut s: Vec<u8> = vec![];
    render_function(module, func, &mut s).unwrap();
    String::from_utf8(s).unwrap()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tests::{diamond_session, DIAMOND_ENTRY};

    #[test]
    fn every_block_and_case_is_drawn() {
        let mut s = diamond_session();
        let f = s.lift_only(DIAMOND_ENTRY).unwrap();
        let dot = generate_dot(s.module(), f);
        assert!(dot.starts_with("digraph LiftedFunction"));
        for name in ["bb_1000", "bb_1010", "bb_1020", "bb_1030"] {
            assert!(dot.contains(name), "{} missing from\n{}", name, dot);
        }
        assert!(dot.contains("label=\"0x1010\""));
        assert!(dot.contains("label=\"default\""));
    }
}
