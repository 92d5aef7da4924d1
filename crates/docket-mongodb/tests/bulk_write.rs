//! Bulk write pipeline against the in-memory executor

mod common;

use std::cell::Cell;
use std::sync::Arc;

use bson::{doc, Bson};
use common::InMemoryExecutor;
use docket_mongodb::{
    BulkWriteError, BulkWriteOptions, Collection, CollectionNamespace, CollectionSettings,
    DocketError, DocumentSchema, FieldCodec, Filter, ServerErrorCategory, Update, WriteModel,
};
use mongodb::options::{Acknowledgment, WriteConcern};

fn people(executor: InMemoryExecutor) -> Collection<InMemoryExecutor> {
    Collection::new(
        CollectionNamespace::new("app", "people").unwrap(),
        Arc::new(DocumentSchema::dynamic()),
        executor,
    )
}

#[tokio::test]
async fn test_three_intent_batch() {
    let collection = people(InMemoryExecutor::with_documents(vec![
        doc! { "_id": 10, "name": "Jill" },
        doc! { "_id": 11, "name": "Bob" },
    ]));

    let result = collection
        .bulk_write(
            vec![
                WriteModel::insert_one(doc! { "_id": 1, "name": "Jack" }),
                WriteModel::update_one(Filter::eq("name", "Jill"), Update::set("age", 30)),
                WriteModel::delete_one(Filter::eq("name", "Bob")),
            ],
            BulkWriteOptions::default(),
        )
        .await
        .unwrap();

    assert!(result.is_acknowledged());
    assert_eq!(result.request_count(), 3);
    assert_eq!(result.inserted_count(), Some(1));
    assert_eq!(result.matched_count(), Some(1));
    assert_eq!(result.modified_count(), Some(1));
    assert_eq!(result.deleted_count(), Some(1));
    assert_eq!(result.processed_requests().len(), 3);

    let stored = collection.executor().documents();
    assert_eq!(
        stored,
        vec![
            doc! { "_id": 10, "name": "Jill", "age": 30 },
            doc! { "_id": 1, "name": "Jack" },
        ]
    );
}

#[tokio::test]
async fn test_ordered_failure_at_index_one_of_three() {
    let collection = people(InMemoryExecutor::with_documents(vec![doc! { "_id": 2 }]));

    let err = collection
        .bulk_write(
            vec![
                WriteModel::insert_one(doc! { "_id": 1 }),
                WriteModel::insert_one(doc! { "_id": 2 }),
                WriteModel::insert_one(doc! { "_id": 3 }),
            ],
            BulkWriteOptions::default(),
        )
        .await
        .unwrap_err();

    let failure = err.failure().expect("partial failure");
    assert_eq!(failure.result.processed_requests().len(), 1);
    assert_eq!(
        failure.result.processed_requests()[0].inserted_document(),
        Some(&doc! { "_id": 1 })
    );
    assert_eq!(failure.write_errors.len(), 1);
    assert_eq!(failure.write_errors[0].index, 1);
    assert_eq!(failure.write_errors[0].code, 11000);
    assert_eq!(failure.write_errors[0].category, ServerErrorCategory::DuplicateKey);
    assert_eq!(failure.unprocessed_requests.len(), 1);
    assert_eq!(
        failure.unprocessed_requests[0].inserted_document(),
        Some(&doc! { "_id": 3 })
    );
}

#[tokio::test]
async fn test_unordered_failure_continues() {
    let collection = people(InMemoryExecutor::with_documents(vec![doc! { "_id": 2 }]));

    let err = collection
        .bulk_write(
            vec![
                WriteModel::insert_one(doc! { "_id": 1 }),
                WriteModel::insert_one(doc! { "_id": 2 }),
                WriteModel::insert_one(doc! { "_id": 3 }),
            ],
            BulkWriteOptions::new().ordered(false),
        )
        .await
        .unwrap_err();

    let failure = err.failure().expect("partial failure");
    assert_eq!(failure.result.processed_requests().len(), 2);
    assert_eq!(failure.result.inserted_count(), Some(2));
    assert_eq!(failure.write_errors[0].index, 1);
    assert!(failure.unprocessed_requests.is_empty());
}

#[tokio::test]
async fn test_intents_consumed_in_one_pass() {
    let collection = people(InMemoryExecutor::new());
    let pulled = Cell::new(0usize);

    let models = (0..4).map(|i| {
        pulled.set(pulled.get() + 1);
        WriteModel::insert_one(doc! { "_id": i })
    });
    let batch = collection.compile(models).unwrap();

    assert_eq!(pulled.get(), 4);
    let ids: Vec<usize> = batch.requests.iter().map(|r| r.correlation_id()).collect();
    assert_eq!(ids, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_pipeline_with_array_filters_rejected_before_execution() {
    let collection = people(InMemoryExecutor::new());
    let pipeline = vec![doc! { "$set": { "a": 1 } }];

    for model in [
        WriteModel::update_one(Filter::empty(), pipeline.clone()),
        WriteModel::update_many(Filter::empty(), pipeline.clone()),
    ] {
        let model = model.with_array_filters(vec![doc! { "x.a": 1 }]);
        let err = collection
            .bulk_write(vec![model], BulkWriteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BulkWriteError::Driver(DocketError::Configuration(_))));
    }
    assert_eq!(collection.executor().batches_executed(), 0);
}

#[tokio::test]
async fn test_unacknowledged_result() {
    let settings = CollectionSettings::default()
        .write_concern(WriteConcern::builder().w(Acknowledgment::Nodes(0)).build());
    let collection = people(InMemoryExecutor::new()).with_settings(settings);

    let result = collection
        .bulk_write(
            vec![
                WriteModel::insert_one(doc! { "_id": 1 }),
                WriteModel::insert_one(doc! { "_id": 2 }),
            ],
            BulkWriteOptions::default(),
        )
        .await
        .unwrap();

    assert!(!result.is_acknowledged());
    assert_eq!(result.request_count(), 2);
    assert_eq!(result.processed_requests().len(), 2);
    assert_eq!(result.inserted_count(), None);
}

#[tokio::test]
async fn test_processed_requests_expose_assigned_ids() {
    let collection = people(InMemoryExecutor::new());

    let result = collection
        .bulk_write(
            vec![WriteModel::insert_one(doc! { "name": "Jack" })],
            BulkWriteOptions::default(),
        )
        .await
        .unwrap();

    let sent = result.processed_requests()[0].inserted_document().unwrap();
    assert!(matches!(sent.get("_id"), Some(Bson::ObjectId(_))));
    assert_eq!(collection.executor().documents(), vec![sent.clone()]);
}

#[tokio::test]
async fn test_upsert_through_single_helper() {
    let collection = people(InMemoryExecutor::new());

    let result = collection
        .update_one(Filter::eq("name", "Zoe"), Update::inc("visits", 1), true)
        .await
        .unwrap();

    match result {
        docket_mongodb::UpdateResult::Acknowledged {
            matched_count,
            upserted_id,
            ..
        } => {
            assert_eq!(matched_count, 0);
            assert!(upserted_id.is_some());
        }
        other => panic!("expected acknowledged result, got {:?}", other),
    }
    let stored = collection.executor().documents();
    assert_eq!(stored[0].get_i32("visits").unwrap(), 1);
}

#[tokio::test]
async fn test_unsigned_filters_reach_the_executor_split() {
    let schema = DocumentSchema::strict("Counter")
        .member_with_codec("Hits", "h", FieldCodec::UInt32)
        .without_id();
    let collection = Collection::new(
        CollectionNamespace::new("app", "counters").unwrap(),
        Arc::new(schema),
        InMemoryExecutor::new(),
    );

    let batch = collection
        .compile(vec![WriteModel::delete_many(Filter::gt("Hits", 0x8000_0000u32))])
        .unwrap();
    match &batch.requests[0] {
        docket_mongodb::WriteRequest::Delete { filter, .. } => assert_eq!(
            filter,
            &doc! { "$and": [{ "h": { "$gt": i32::MIN } }, { "h": { "$lt": 0 } }] }
        ),
        other => panic!("expected delete, got {:?}", other),
    }
}
