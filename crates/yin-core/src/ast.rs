//! The Universal AST (§3): the nested, map-shaped program representation
//! that source-language front-ends emit. This is the input to projection
//! (§4.1, implemented in `yin-runtime::project`), not something any VM
//! backend consumes directly except the tree-walker.

use crate::attribute::Scalar;
use serde::{Deserialize, Serialize};

/// A node of the Universal AST, discriminated by `yin/type`.
///
/// `#[serde(tag = "yin/type")]` makes the Rust enum round-trip through the
/// same wire shape a front-end parser would emit: a map with a `yin/type`
/// key naming the variant and the variant's own fields alongside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "yin/type")]
pub enum AstNode {
    #[serde(rename = "literal")]
    Literal { value: Scalar },

    #[serde(rename = "variable")]
    Variable { name: String },

    #[serde(rename = "lambda")]
    Lambda {
        params: Vec<String>,
        body: Box<AstNode>,
    },

    #[serde(rename = "application")]
    Application {
        operator: Box<AstNode>,
        operands: Vec<AstNode>,
    },

    #[serde(rename = "if")]
    If {
        test: Box<AstNode>,
        consequent: Box<AstNode>,
        alternate: Box<AstNode>,
    },

    #[serde(rename = "vm/gensym")]
    Gensym { prefix: String },

    #[serde(rename = "vm/store-get")]
    StoreGet { key: String },

    #[serde(rename = "vm/store-put")]
    StorePut { key: String, val: Box<AstNode> },

    #[serde(rename = "stream/make")]
    StreamMake { buffer: Option<usize> },

    #[serde(rename = "stream/put")]
    StreamPut {
        target: Box<AstNode>,
        val: Box<AstNode>,
    },

    #[serde(rename = "stream/cursor")]
    StreamCursor { source: Box<AstNode> },

    #[serde(rename = "stream/next")]
    StreamNext { source: Box<AstNode> },

    #[serde(rename = "stream/close")]
    StreamClose { source: Box<AstNode> },
}

impl AstNode {
    /// The `yin/type` keyword for this node, as it would be projected.
    pub fn type_name(&self) -> &'static str {
        match self {
            AstNode::Literal { .. } => "literal",
            AstNode::Variable { .. } => "variable",
            AstNode::Lambda { .. } => "lambda",
            AstNode::Application { .. } => "application",
            AstNode::If { .. } => "if",
            AstNode::Gensym { .. } => "vm/gensym",
            AstNode::StoreGet { .. } => "vm/store-get",
            AstNode::StorePut { .. } => "vm/store-put",
            AstNode::StreamMake { .. } => "stream/make",
            AstNode::StreamPut { .. } => "stream/put",
            AstNode::StreamCursor { .. } => "stream/cursor",
            AstNode::StreamNext { .. } => "stream/next",
            AstNode::StreamClose { .. } => "stream/close",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let ast = AstNode::Application {
            operator: Box::new(AstNode::Variable { name: "+".into() }),
            operands: vec![
                AstNode::Literal { value: Scalar::Int(10) },
                AstNode::Literal { value: Scalar::Int(20) },
            ],
        };
        let json = serde_json::to_string(&ast).unwrap();
        let back: AstNode = serde_json::from_str(&json).unwrap();
        assert_eq!(ast, back);
    }

    #[test]
    fn type_name_matches_tag() {
        let node = AstNode::If {
            test: Box::new(AstNode::Literal { value: Scalar::Bool(true) }),
            consequent: Box::new(AstNode::Literal { value: Scalar::Int(1) }),
            alternate: Box::new(AstNode::Literal { value: Scalar::Int(0) }),
        };
        assert_eq!(node.type_name(), "if");
    }
}
