use blockbind::error::BlockError;
use blockbind::metadata::{CollectionDescriptor, FieldDescriptor};
use blockbind::resolver::SourceIdProvider;
use blockbind::resource::HandleKind;
use blockbind::{
    resolve, BlockKind, InMemoryCollectionManager, InMemoryResourceClient, ResolutionContext,
    ResolutionRule, ResourceClient, ResourceHandle,
};
use proptest::prelude::*;
use proptest::test_runner::Config as ProptestConfig;
use serde_json::json;
use std::rc::Rc;

#[derive(Debug, Clone, Copy)]
enum ParentShape {
    None,
    Data,
    TableField,
    /// Table-field kind whose handle is not an embedded one.
    TableFieldKindRemoteHandle,
}

#[derive(Debug, Clone)]
struct Shape {
    parent: ParentShape,
    table_field_child: bool,
    without_table_field_resource: bool,
    resource: bool,
    association: bool,
    source_id: Option<u8>,
    /// Whether the record carries `__parent`.
    parent_record: bool,
}

fn arb_parent() -> impl Strategy<Value = ParentShape> {
    prop_oneof![
        Just(ParentShape::None),
        Just(ParentShape::Data),
        Just(ParentShape::TableField),
        Just(ParentShape::TableFieldKindRemoteHandle),
    ]
}

fn arb_shape() -> impl Strategy<Value = Shape> {
    (
        arb_parent(),
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
        prop::option::of(0u8..3),
        any::<bool>(),
    )
        .prop_map(
            |(parent, table_field_child, without, resource, association, source_id, parent_record)| {
                Shape {
                    parent,
                    table_field_child,
                    without_table_field_resource: without,
                    resource,
                    association,
                    source_id,
                    parent_record,
                }
            },
        )
}

fn metadata() -> InMemoryCollectionManager {
    InMemoryCollectionManager::new()
        .with_collection(
            CollectionDescriptor::new("customers")
                .with_field(FieldDescriptor::new("id", "bigInt").with_primary_key())
                .with_field(FieldDescriptor::has_many("orders", "orders", "customerId")),
        )
        .with_collection(
            CollectionDescriptor::new("orders")
                .with_field(FieldDescriptor::new("id", "bigInt").with_primary_key()),
        )
}

fn build(shape: &Shape, client: Rc<dyn ResourceClient>) -> ResolutionContext {
    let record = if shape.parent_record {
        json!({"id": 7, "orders": [{"id": 1}], "__parent": {"id": 3}})
    } else {
        json!({"id": 7, "orders": [{"id": 1}]})
    };
    let mut ctx = ResolutionContext::new().with_record(record.clone());
    ctx = match shape.parent {
        ParentShape::None => ctx,
        ParentShape::Data => ctx.with_parent(
            BlockKind::Data,
            Rc::new(ResourceHandle::root("customers", client.clone())),
        ),
        ParentShape::TableField => ctx.with_parent(
            BlockKind::TableField,
            Rc::new(ResourceHandle::table_field("orders", "orders", None, None, &record)),
        ),
        ParentShape::TableFieldKindRemoteHandle => ctx.with_parent(
            BlockKind::TableField,
            Rc::new(ResourceHandle::root("orders", client.clone())),
        ),
    };
    if shape.table_field_child {
        ctx = ctx.as_table_field_child("orders");
    }
    if shape.resource {
        ctx = ctx.with_resource("customers");
    }
    if shape.association {
        ctx = ctx.with_association("customers.orders");
    }
    ctx = match shape.source_id {
        None => ctx,
        Some(0) => ctx.with_source_id(SourceIdProvider::Explicit(json!(42))),
        Some(1) => ctx.with_source_id(SourceIdProvider::FromRecord),
        Some(_) => ctx.with_source_id(SourceIdProvider::FromParentRecord),
    };
    ctx.without_table_field_resource = shape.without_table_field_resource;
    ctx
}

/// First matching rule in precedence order; `None` when nothing applies.
fn expected_rule(shape: &Shape) -> Option<ResolutionRule> {
    if shape.table_field_child {
        return Some(ResolutionRule::TableField);
    }
    if matches!(shape.parent, ParentShape::TableField) && !shape.without_table_field_resource {
        return Some(ResolutionRule::BorrowedFromParent);
    }
    if !shape.association {
        return shape.resource.then_some(ResolutionRule::Root);
    }
    match shape.source_id {
        // the parent-record provider yields nothing without `__parent`
        Some(2) if !shape.parent_record => Some(ResolutionRule::AssociationFromRecord),
        Some(_) => Some(ResolutionRule::AssociationWithSourceId),
        None => Some(ResolutionRule::AssociationFromRecord),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_exactly_one_rule_in_precedence_order(shape in arb_shape()) {
        let client: Rc<dyn ResourceClient> = Rc::new(InMemoryResourceClient::new());
        let ctx = build(&shape, client.clone());
        let result = resolve(&ctx, &metadata(), client);

        match (expected_rule(&shape), result) {
            (Some(rule), Ok(resolution)) => {
                prop_assert_eq!(resolution.rule, rule);
                let expected_kind = match rule {
                    ResolutionRule::TableField | ResolutionRule::BorrowedFromParent => HandleKind::TableField,
                    ResolutionRule::Root => HandleKind::Root,
                    _ => HandleKind::Association,
                };
                prop_assert_eq!(resolution.handle.kind(), expected_kind);
                if rule == ResolutionRule::BorrowedFromParent {
                    let parent = ctx.parent.as_ref().unwrap();
                    prop_assert!(Rc::ptr_eq(&resolution.handle, &parent.handle));
                } else if let Some(parent) = &ctx.parent {
                    prop_assert!(!Rc::ptr_eq(&resolution.handle, &parent.handle));
                }
            }
            (None, Err(e)) => {
                prop_assert!(matches!(e, BlockError::ResolutionAmbiguous(_)), "unexpected error {:?}", e);
            }
            (expected, got) => {
                prop_assert!(false, "expected {:?}, got {:?}", expected, got.map(|r| r.rule));
            }
        }
    }

    #[test]
    fn prop_association_source_id_follows_provider(provider in 0u8..4, parent_record in any::<bool>()) {
        let client: Rc<dyn ResourceClient> = Rc::new(InMemoryResourceClient::new());
        let shape = Shape {
            parent: ParentShape::None,
            table_field_child: false,
            without_table_field_resource: false,
            resource: false,
            association: true,
            source_id: (provider < 3).then_some(provider),
            parent_record,
        };
        let resolution = resolve(&build(&shape, client.clone()), &metadata(), client).unwrap();
        let expected = match provider {
            0 => json!(42),
            2 if parent_record => json!(3),
            _ => json!(7),
        };
        prop_assert_eq!(resolution.handle.source_id(), Some(&expected));
        prop_assert_eq!(resolution.handle.collection(), "orders");
    }
}
