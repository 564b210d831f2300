use blockbind::block::{Pagination, Sorter};
use blockbind::filter_graph::FilterState;
use blockbind::metadata::{CollectionDescriptor, FieldDescriptor};
use blockbind::{
    BlockSpec, CollectionMetadata, FilterTarget, InMemoryCollectionManager, InMemoryResourceClient,
    Page, ResourceAction, ResourceClient, SchemaNode,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::rc::Rc;

fn metadata() -> Rc<dyn CollectionMetadata> {
    Rc::new(
        InMemoryCollectionManager::new()
            .with_collection(
                CollectionDescriptor::new("customers")
                    .with_field(FieldDescriptor::new("id", "bigInt").with_primary_key())
                    .with_field(FieldDescriptor::new("name", "string"))
                    .with_field(FieldDescriptor::has_many("orders", "orders", "customerId")),
            )
            .with_collection(
                CollectionDescriptor::new("orders")
                    .with_field(FieldDescriptor::new("id", "bigInt").with_primary_key())
                    .with_field(FieldDescriptor::new("code", "string"))
                    .with_field(FieldDescriptor::belongs_to("customer", "customers", "customerId")),
            ),
    )
}

fn setup() -> (Page, Rc<InMemoryResourceClient>) {
    let metadata = metadata();
    let client = Rc::new(
        InMemoryResourceClient::new()
            .with_metadata(metadata.clone())
            .with_records(
                "customers",
                vec![json!({"id": 7, "name": "Ada"}), json!({"id": 8, "name": "Grace"})],
            )
            .with_records(
                "orders",
                vec![
                    json!({"id": 1, "code": "A-1", "customerId": 7}),
                    json!({"id": 2, "code": "B-1", "customerId": 8}),
                    json!({"id": 3, "code": "A-2", "customerId": 7}),
                ],
            ),
    );
    let dyn_client: Rc<dyn ResourceClient> = client.clone();
    (Page::new(metadata, dyn_client), client)
}

fn codes(page: &Page, name: &str) -> Vec<Value> {
    let node = page.block_by_name(name).unwrap();
    page.table_props(node.id).unwrap()["rows"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["code"].clone())
        .collect()
}

#[tokio::test]
async fn test_customer_selection_filters_orders() {
    let (page, client) = setup();
    let orders = page
        .mount(BlockSpec::data("orders").named("orders"), None, Value::Null)
        .unwrap();
    let customers = page
        .mount(
            BlockSpec::filter("customers")
                .named("customers")
                .with_targets(vec![FilterTarget::new("orders").on_field("customerId")]),
            None,
            Value::Null,
        )
        .unwrap();
    page.load_all().await;
    assert_eq!(codes(&page, "orders").len(), 3);

    // move the orders table off page 1 first
    page.on_change(orders, Pagination { current: 2, page_size: 2 }, None)
        .await
        .unwrap();

    let outcomes = page
        .on_row_selection_change(customers, vec![json!(7)])
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].target, orders);

    let call = client.last_call("orders", ResourceAction::List).unwrap();
    assert_eq!(
        call.params.filter.as_ref().map(|f| f.to_value()),
        Some(json!({"$and": [{"customerId": {"$eq": 7}}]}))
    );
    assert_eq!(call.params.page, Some(1));
    assert_eq!(call.params.page_size, Some(2));
    assert_eq!(codes(&page, "orders"), vec![json!("A-1"), json!("A-2")]);
    assert_eq!(
        page.graph().target(orders).unwrap().filter_state(),
        FilterState::Idle
    );

    page.clear_selection(customers).await.unwrap();
    let call = client.last_call("orders", ResourceAction::List).unwrap();
    assert_eq!(call.params.filter, None);
    assert_eq!(codes(&page, "orders").len(), 2);
    assert!(page.graph().target(orders).unwrap().filter_map().is_empty());
}

#[tokio::test]
async fn test_multiple_selection_uses_in() {
    let (page, client) = setup();
    page.mount(BlockSpec::data("orders").named("orders"), None, Value::Null)
        .unwrap();
    let customers = page
        .mount(
            BlockSpec::filter("customers")
                .named("customers")
                .with_targets(vec![FilterTarget::new("orders").on_field("customerId")]),
            None,
            Value::Null,
        )
        .unwrap();

    page.on_row_selection_change(customers, vec![json!(7), json!(8), json!(7)])
        .await
        .unwrap();
    let call = client.last_call("orders", ResourceAction::List).unwrap();
    assert_eq!(
        call.params.filter.unwrap().to_value(),
        json!({"$and": [{"customerId": {"$in": [7, 8]}}]})
    );
    assert_eq!(codes(&page, "orders").len(), 3);
}

#[tokio::test]
async fn test_sort_survives_filter_refetch() {
    let (page, client) = setup();
    let orders = page
        .mount(BlockSpec::data("orders").named("orders"), None, Value::Null)
        .unwrap();
    let customers = page
        .mount(
            BlockSpec::filter("customers")
                .named("customers")
                .with_targets(vec![FilterTarget::new("orders").on_field("customerId")]),
            None,
            Value::Null,
        )
        .unwrap();
    page.load(orders).await.unwrap();
    page.on_change(
        orders,
        Pagination { current: 1, page_size: 20 },
        Some(Sorter {
            field: "id".into(),
            order: Some(blockbind::block::SortOrder::Descend),
        }),
    )
    .await
    .unwrap();

    page.on_row_selection_change(customers, vec![json!(7)])
        .await
        .unwrap();
    let call = client.last_call("orders", ResourceAction::List).unwrap();
    assert_eq!(call.params.sort, Some(vec!["-id".to_string()]));
    assert_eq!(codes(&page, "orders"), vec![json!("A-2"), json!("A-1")]);
}

#[tokio::test]
async fn test_schema_page_round() {
    let (page, client) = setup();
    let schema = SchemaNode::from_value(json!({
        "properties": {
            "customers": {
                "x-uid": "customers",
                "x-decorator": "TableBlockProvider",
                "x-decorator-props": {
                    "collection": "customers",
                    "action": "list",
                    "blockType": "filter"
                },
                "x-filter-targets": [{"uid": "orders", "field": "customerId"}]
            },
            "orders": {
                "x-uid": "orders",
                "x-decorator": "TableBlockProvider",
                "x-decorator-props": {"collection": "orders", "action": "list"},
                "properties": {
                    "table": {
                        "x-component": "TableV2",
                        "properties": {
                            "customer": {
                                "x-component": "TableV2.Column",
                                "properties": {
                                    "customer.name": {"x-collection-field": "orders.customer.name"}
                                }
                            }
                        }
                    }
                }
            }
        }
    }))
    .unwrap();
    page.mount_schema(&schema, Value::Null).unwrap();
    assert!(page.load_all().await.iter().all(|(_, r)| r.is_ok()));

    let customers = page.block_by_name("customers").unwrap();
    page.on_click_row(customers.id, &json!({"id": 8, "name": "Grace"}))
        .await
        .unwrap();
    assert_eq!(codes(&page, "orders"), vec![json!("B-1")]);

    let call = client.last_call("orders", ResourceAction::List).unwrap();
    assert_eq!(call.params.appends, Some(vec!["customer".to_string()]));
    let props = page.table_props(page.block_by_name("orders").unwrap().id).unwrap();
    assert_eq!(props["rows"][0]["customer"]["name"], json!("Grace"));
    assert_eq!(props["pagination"]["total"], json!(1));
}
