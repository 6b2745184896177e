use orm_cache::{
    AccessType, CacheEntry, CacheKeysFactory, CacheValue, EntityPersister, Identifier,
    PersisterMetadata, PropertyAccess, QueryKey, RegionFactory, RegionKind,
};

use std::{sync::Arc, thread};

struct Product {
    id: i64,
    name: String,
    price: i64,
}

impl PropertyAccess for Product {
    fn property_count(&self) -> usize {
        2
    }

    fn get(&self, index: usize) -> CacheValue {
        match index {
            0 => self.name.as_str().into(),
            _ => self.price.into(),
        }
    }

    fn set(&mut self, index: usize, value: CacheValue) {
        match index {
            0 => self.name = value.as_text().unwrap_or_default().to_string(),
            _ => self.price = value.as_int().unwrap_or_default(),
        }
    }
}

struct ProductPersister {
    spaces: Vec<String>,
    properties: Vec<String>,
}

impl Default for ProductPersister {
    fn default() -> Self {
        Self {
            spaces: vec!["product".into()],
            properties: vec!["name".into(), "price".into()],
        }
    }
}

impl PersisterMetadata for ProductPersister {
    fn role(&self) -> &str {
        "Product"
    }

    fn table_spaces(&self) -> &[String] {
        &self.spaces
    }
}

impl EntityPersister for ProductPersister {
    type Entity = Product;

    fn property_names(&self) -> &[String] {
        &self.properties
    }

    fn identifier(&self, product: &Product) -> Identifier {
        product.id.into()
    }
}

struct Tags(Vec<String>);

impl PersisterMetadata for Tags {
    fn role(&self) -> &str {
        "Product.tags"
    }

    fn table_spaces(&self) -> &[String] {
        &self.0
    }
}

fn factory() -> RegionFactory {
    let _ = env_logger::builder().is_test(true).try_init();
    let factory = RegionFactory::builder()
        .use_query_cache(true)
        .default_access_type(AccessType::ReadWrite)
        .build();
    let products = factory
        .build_domain_region(RegionKind::Entity, "Product", None)
        .expect("Failed to build the product region");
    factory
        .register_entity(&ProductPersister::default(), &products)
        .expect("Failed to register products");
    let tags = factory
        .build_domain_region(RegionKind::Collection, "Product.tags", None)
        .expect("Failed to build the tags region");
    factory
        .register_collection(&Tags(vec!["product_tag".into()]), &tags)
        .expect("Failed to register tags");
    factory
}

fn load(factory: &RegionFactory, id: i64) -> bool {
    let persister = ProductPersister::default();
    let product = Product {
        id,
        name: format!("product {id}"),
        price: 100,
    };
    let key = CacheKeysFactory::create_entity_key(id, &persister, None);
    let tx = factory.begin_transaction();
    let region = factory.entity_access("Product").expect("Product is cached");
    region
        .put_from_load(&key, CacheEntry::disassemble(&persister, &product), &tx, None, false)
        .expect("put_from_load failed")
}

#[test]
fn bulk_update_invalidates_entities_and_queries() -> anyhow::Result<()> {
    let factory = factory();
    for id in 0..10 {
        assert!(load(&factory, id));
    }
    let tags = factory.collection_access("Product.tags").expect("tags are cached");
    let tag_key = CacheKeysFactory::create_collection_key(1, &Tags(vec![]), None);
    tags.put_from_load(
        &tag_key,
        CacheEntry::new(vec![CacheValue::List(vec!["sale".into()])], None),
        &factory.begin_transaction(),
        None,
        false,
    )?;

    let queries = factory.query_results_cache()?;
    let cheap = QueryKey::new("select id from product where price < ?", vec![200.into()]);
    queries.put(cheap.clone(), vec![vec![1.into()]], &factory.begin_transaction())?;
    assert!(queries
        .get(&cheap, &["product"], &factory.begin_transaction())?
        .is_some());

    // update Product set price = price * 2
    let bulk = factory.begin_transaction();
    factory.coordinate_shared_cache_cleanup(&["product"], &bulk)?;
    for id in 0..10 {
        assert!(!factory.contains_entity("Product", id));
    }
    assert!(tags.contains(&tag_key));
    assert!(queries
        .get(&cheap, &["product"], &factory.begin_transaction())?
        .is_none());

    // Concurrent sessions keep loading while the statement runs.
    let factory = Arc::new(factory);
    let loaders: Vec<_> = (0..4)
        .map(|t| {
            let factory = Arc::clone(&factory);
            thread::spawn(move || {
                for id in (t * 10)..(t * 10 + 10) {
                    load(&factory, id);
                }
            })
        })
        .collect();
    for loader in loaders {
        loader.join().expect("loader panicked");
    }
    bulk.complete(true);

    for id in 0..40 {
        assert!(!factory.contains_entity("Product", id), "product {id}");
    }
    let stats = factory.statistics("default-update-timestamps-region")?;
    assert!(stats.put_count() >= 2);

    // Results read after the statement are cached again.
    let tx = factory.begin_transaction();
    queries.put(cheap.clone(), vec![], &tx)?;
    assert_eq!(
        queries.get(&cheap, &["product"], &factory.begin_transaction())?,
        Some(vec![])
    );
    Ok(())
}

#[test]
fn evict_all_and_shutdown() -> anyhow::Result<()> {
    let factory = factory();
    assert!(load(&factory, 1));
    factory.evict_all()?;
    assert!(!factory.contains_entity("Product", 1));
    assert!(load(&factory, 1));

    let products = factory.region("Product")?;
    factory.shutdown();
    assert!(products.is_destroyed());
    assert!(factory.region("Product").is_err());
    Ok(())
}
